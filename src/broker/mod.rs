//! Broker integration
//!
//! This module provides everything needed to receive build events from
//! the build service's RabbitMQ bus:
//!
//! - [`profile`]: server profiles (broker URL, API URL, routing key)
//! - [`message`]: delivery and build event types
//! - [`subscription`]: the reconnecting subscription loop and its seams
//! - [`amqp`]: the `lapin`-based connector used in production
//!
//! # Example
//!
//! ```rust,no_run
//! use obs_watcher::broker::{
//!     AmqpConnector, BrokerMessage, MessageHandler, ReconnectPolicy, ServerKind, Subscription,
//! };
//!
//! struct PrintHandler;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for PrintHandler {
//!     async fn handle(&self, message: BrokerMessage) {
//!         println!("{}: {}", message.routing_key, message.body_lossy());
//!     }
//! }
//!
//! # async fn example() {
//! let target = ServerKind::Obs.profile().target();
//! let mut subscription =
//!     Subscription::new(AmqpConnector::new(), target, ReconnectPolicy::default());
//! let fatal = subscription.run(&PrintHandler).await;
//! eprintln!("subscription ended: {fatal}");
//! # }
//! ```

pub mod amqp;
pub mod message;
pub mod profile;
pub mod subscription;

pub use amqp::AmqpConnector;
pub use message::{BrokerMessage, BuildEvent, DecodeError};
pub use profile::{redact_url, ServerKind, ServerProfile, SubscriptionTarget, EXCHANGE};
pub use subscription::{
    Connector, MessageHandler, ReconnectPolicy, Session, Subscription, SubscriptionError,
    SubscriptionState,
};
