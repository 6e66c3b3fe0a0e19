//! AMQP connector for the build service's RabbitMQ bus.
//!
//! Implements [`Connector`] and [`Session`] on top of `lapin`. The setup
//! sequence mirrors what every OBS/IBS listener does:
//!
//! 1. connect to the profile's `amqps://` URL
//! 2. open a channel
//! 3. passively declare the `pubsub` topic exchange (it must exist)
//! 4. declare an exclusive, server-named, auto-deleted queue
//! 5. bind it with `<prefix>.package.build_success`
//! 6. consume with `no_ack`
//!
//! Errors are classified into [`SubscriptionError::Retryable`] for
//! connection-level trouble and [`SubscriptionError::Fatal`] for
//! everything the broker reports at the protocol level.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, info};

use super::message::BrokerMessage;
use super::profile::SubscriptionTarget;
use super::subscription::{Connector, Session, SubscriptionError};

/// Consumer tag announced to the broker.
const CONSUMER_TAG: &str = "obs-watcher";

/// Connector that talks AMQP 0-9-1 to a real broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    /// Creates a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        target: &SubscriptionTarget,
    ) -> Result<Box<dyn Session>, SubscriptionError> {
        let connection = Connection::connect(&target.url, ConnectionProperties::default())
            .await
            .map_err(|e| classify(&e))?;
        debug!(url = %target.redacted_url(), "Connected to broker");

        let channel = connection.create_channel().await.map_err(|e| classify(&e))?;

        channel
            .exchange_declare(
                &target.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                &target.exchange,
                &target.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify(&e))?;

        info!(
            queue = %queue_name,
            exchange = %target.exchange,
            routing_key = %target.routing_key,
            "Bound private queue"
        );

        Ok(Box::new(AmqpSession {
            _connection: connection,
            _channel: channel,
            consumer,
        }))
    }
}

/// A consuming AMQP session.
///
/// Holds the connection and channel so they stay open as long as the
/// consumer is read from.
struct AmqpSession {
    _connection: Connection,
    _channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Session for AmqpSession {
    async fn next_message(&mut self) -> Result<BrokerMessage, SubscriptionError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(BrokerMessage {
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data,
            }),
            Some(Err(err)) => Err(classify(&err)),
            None => Err(SubscriptionError::Fatal(
                "consumer cancelled by broker".to_string(),
            )),
        }
    }
}

/// Maps a `lapin` error onto the reconnect-vs-fatal decision.
///
/// Transport failures (IO, missed heartbeats, a connection that is no
/// longer usable) are retried. Anything the broker said at the protocol
/// level, including closing the channel or the connection, is fatal.
pub fn classify(err: &lapin::Error) -> SubscriptionError {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError
        | lapin::Error::InvalidConnectionState(_) => SubscriptionError::Retryable(err.to_string()),
        _ => SubscriptionError::Fatal(err.to_string()),
    }
}
