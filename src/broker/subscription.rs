//! Broker subscription lifecycle and reconnection policy.
//!
//! A [`Subscription`] drives a [`Connector`] through three states:
//!
//! ```text
//! Connecting --connect+subscribe ok--> Consuming
//! Connecting/Consuming --Retryable--> Connecting   (after backoff)
//! Connecting/Consuming --Fatal------> ClosedFatal  (run() returns)
//! ```
//!
//! The AMQP specifics live in [`super::amqp`]; everything here works
//! against the [`Connector`] and [`Session`] traits so that the state
//! machine can be driven by an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::message::BrokerMessage;
use super::profile::SubscriptionTarget;

/// Outcome of a failed connect or consume step.
///
/// The variant decides what the subscription loop does next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Connection-level failure (network loss, broker restart). The
    /// subscription reconnects.
    #[error("Retryable broker error: {0}")]
    Retryable(String),

    /// Protocol-level failure (channel closed by the broker, failed
    /// passive declare, connection closed by the broker). The
    /// subscription stops.
    #[error("Fatal broker error: {0}")]
    Fatal(String),
}

impl SubscriptionError {
    /// True for errors the loop recovers from by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Opens broker sessions bound to a target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects, verifies the exchange, declares and binds a private
    /// queue and starts consuming from it.
    async fn connect(
        &self,
        target: &SubscriptionTarget,
    ) -> Result<Box<dyn Session>, SubscriptionError>;
}

/// A live, consuming broker session.
#[async_trait]
pub trait Session: Send {
    /// Waits for the next delivery.
    async fn next_message(&mut self) -> Result<BrokerMessage, SubscriptionError>;
}

/// Handler trait for processing deliveries.
///
/// Deliveries are acknowledged by the broker as soon as they are sent
/// (`no_ack`), so the handler cannot reject them; it is called once per
/// message and the loop waits for it before reading the next one.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery.
    async fn handle(&self, message: BrokerMessage);
}

/// Where the subscription currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Establishing connection, channel, queue and consumer.
    Connecting,
    /// Receiving deliveries.
    Consuming,
    /// A fatal error ended the subscription.
    ClosedFatal,
}

/// Backoff between reconnect attempts.
///
/// The delay starts at `initial` and doubles per consecutive failure up
/// to `max`. An `initial` of zero disables waiting entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
}

impl ReconnectPolicy {
    /// Creates a policy.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Reconnect immediately, forever.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before reconnect attempt number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 || self.initial.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// A single subscription to one routing key on one broker.
pub struct Subscription<C: Connector> {
    connector: C,
    target: SubscriptionTarget,
    policy: ReconnectPolicy,
    state: SubscriptionState,
    connect_attempts: u64,
    delivered: u64,
}

impl<C: Connector> Subscription<C> {
    /// Creates a subscription; nothing is connected until [`Self::run`].
    pub fn new(connector: C, target: SubscriptionTarget, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            target,
            policy,
            state: SubscriptionState::Connecting,
            connect_attempts: 0,
            delivered: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Number of connect attempts made so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    /// Number of deliveries handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Subscription target.
    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Runs the subscription until a fatal error occurs.
    ///
    /// Retryable errors lead back to `Connecting`, after the policy's
    /// backoff. Every delivery with a non-empty routing key is handed to
    /// `handler`; the next one is read only after the handler returns.
    ///
    /// # Returns
    ///
    /// The fatal error that ended the subscription.
    pub async fn run<H: MessageHandler + ?Sized>(&mut self, handler: &H) -> SubscriptionError {
        let mut failures: u32 = 0;

        loop {
            self.state = SubscriptionState::Connecting;
            self.connect_attempts += 1;

            let err = match self.consume(handler, &mut failures).await {
                Ok(never) => match never {},
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.state = SubscriptionState::ClosedFatal;
                error!(
                    routing_key = %self.target.routing_key,
                    error = %err,
                    "Subscription closed, not reconnecting"
                );
                return err;
            }

            failures = failures.saturating_add(1);
            let delay = self.policy.delay(failures);
            warn!(
                routing_key = %self.target.routing_key,
                error = %err,
                attempt = self.connect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Broker connection lost, reconnecting"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn consume<H: MessageHandler + ?Sized>(
        &mut self,
        handler: &H,
        failures: &mut u32,
    ) -> Result<std::convert::Infallible, SubscriptionError> {
        debug!(
            url = %self.target.redacted_url(),
            exchange = %self.target.exchange,
            routing_key = %self.target.routing_key,
            "Connecting to broker"
        );

        let mut session = self.connector.connect(&self.target).await?;

        self.state = SubscriptionState::Consuming;
        *failures = 0;
        info!(
            routing_key = %self.target.routing_key,
            "Waiting for build events"
        );

        loop {
            let message = session.next_message().await?;

            if message.routing_key.is_empty() {
                debug!("Ignoring delivery without routing key");
                continue;
            }

            self.delivered += 1;
            handler.handle(message).await;
        }
    }
}
