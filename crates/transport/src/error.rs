//! Error type shared by the subscriber and publisher links.
//!
//! Connection-level failures (`Connect`, `Closed`, the wrapped client errors)
//! are never fatal to a link: they end the current session and the link
//! schedules a reconnection. Per-operation failures (`Subscribe`, `Publish`,
//! `Nacked`, `NotReady`) are returned to the caller, which decides whether to
//! log, drop or retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The client could not be built from configuration (bad URL, options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// Establishing a session with the broker failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// An established session was closed by the broker or the network.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The broker or client rejected a subscription request.
    #[error("Subscription to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// A publish attempt failed after the link was `Ready`.
    #[error("Publish error: {0}")]
    Publish(String),

    /// The broker negatively acknowledged a published message.
    #[error("Broker rejected message for queue '{queue}'")]
    Nacked { queue: String },

    /// Publish was called while the link had no established session.
    ///
    /// No network call is made when this is returned.
    #[error("Link is not ready (state: {state})")]
    NotReady { state: String },

    /// MQTT client request could not be queued (event loop stopped, channel full).
    #[cfg(feature = "mqtt")]
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    /// MQTT event loop failure; boxed to keep the enum small.
    #[cfg(feature = "mqtt")]
    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] Box<rumqttc::ConnectionError>),

    #[cfg(feature = "amqp")]
    #[error("AMQP connection error: {0}")]
    AmqpConnect(#[source] lapin::Error),

    #[cfg(feature = "amqp")]
    #[error("AMQP channel error: {0}")]
    AmqpChannel(#[source] lapin::Error),

    #[cfg(feature = "amqp")]
    #[error("Declaring queue '{queue}' failed: {source}")]
    AmqpDeclare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[cfg(feature = "amqp")]
    #[error("AMQP publish error: {0}")]
    AmqpPublish(#[source] lapin::Error),
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::MqttConnection(Box::new(err))
    }
}

/// Walks the source chain and returns the innermost message, without quotes.
pub fn root_cause(e: &(dyn std::error::Error + 'static)) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
