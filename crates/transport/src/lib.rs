//! Reconnecting broker links for `sensorbridge`.
//!
//! - [`mqtt::SubscriberLink`] keeps one MQTT subscription alive and forwards
//!   every inbound PUBLISH to a bounded channel.
//! - [`amqp::QueuePublisherLink`] keeps one AMQP channel with a declared durable
//!   queue open; [`amqp::QueueHandle`] publishes through it.
//!
//! Both links cycle `Disconnected → Connecting → established` forever, waiting
//! the [`Backoff`] delay between attempts, and expose their state through a
//! `tokio::sync::watch` channel. Each protocol sits behind a feature flag.

pub mod backoff;
pub mod error;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use backoff::{Backoff, ReconnectConfig, DEFAULT_RECONNECT_DELAY};
pub use error::{root_cause, TransferError};

pub type Result<T> = std::result::Result<T, TransferError>;
