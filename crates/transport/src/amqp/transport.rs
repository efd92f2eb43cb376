//! Publish-side transport abstraction and its `lapin` implementation.
//!
//! A [`QueueConnector`] opens sessions; a [`QueueSession`] is one connection
//! plus one confirm-mode channel on which the target queue has been declared.
//! The link opens a new session whenever the previous one reports itself
//! closed.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::config::AmqpConfig;
use crate::error::{root_cause, TransferError};

const PERSISTENT_DELIVERY: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";

#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Connects, opens a channel and declares the queue.
    ///
    /// Succeeds only when all three steps succeeded.
    async fn open(&self) -> Result<Arc<dyn QueueSession>, TransferError>;
}

#[async_trait]
pub trait QueueSession: Send + Sync {
    /// Publishes one persistent message to the session's queue.
    async fn publish(&self, payload: &[u8]) -> Result<(), TransferError>;

    /// Resolves with a reason once the session can no longer be used.
    async fn closed(&self) -> String;

    /// Closes the connection gracefully. Never fails.
    async fn close(&self);
}

/// [`QueueConnector`] backed by `lapin`.
pub struct LapinConnector {
    config: AmqpConfig,
}

impl LapinConnector {
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }

    /// Parses the configured URL and applies explicit credentials.
    fn uri(&self) -> Result<AMQPUri, TransferError> {
        let mut uri: AMQPUri = self.config.url.parse().map_err(|e| {
            TransferError::ClientSetup(format!("Invalid AMQP url '{}': {e}", self.config.url))
        })?;
        if let Some(username) = &self.config.username {
            uri.authority.userinfo.username = username.clone();
        }
        if let Some(password) = &self.config.password {
            uri.authority.userinfo.password = password.clone();
        }
        Ok(uri)
    }
}

#[async_trait]
impl QueueConnector for LapinConnector {
    async fn open(&self) -> Result<Arc<dyn QueueSession>, TransferError> {
        let uri = self.uri()?;
        let queue = self.config.queue.clone();

        info!(
            "Connecting to AMQP broker at {}:{}",
            uri.authority.host, uri.authority.port
        );
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(TransferError::AmqpConnect)?;

        let (failure_tx, failures) = mpsc::unbounded_channel();
        let on_error = failure_tx.clone();
        connection.on_error(move |err| {
            let _ = on_error.send(root_cause(&err));
        });

        let channel = match open_channel(&connection, &queue).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(0, "setup failed").await {
                    debug!("Error closing AMQP connection after setup failure: {close_err}");
                }
                return Err(e);
            }
        };
        info!(queue = %queue, "AMQP channel open, queue declared durable");

        Ok(Arc::new(LapinSession {
            connection,
            channel,
            queue,
            failure_tx,
            failures: Mutex::new(failures),
        }))
    }
}

async fn open_channel(connection: &Connection, queue: &str) -> Result<Channel, TransferError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(TransferError::AmqpChannel)?;
    debug!(channel_id = channel.id(), "AMQP channel created");

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(TransferError::AmqpChannel)?;

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| TransferError::AmqpDeclare {
            queue: queue.to_string(),
            source,
        })?;

    Ok(channel)
}

struct LapinSession {
    connection: Connection,
    channel: Channel,
    queue: String,
    failure_tx: mpsc::UnboundedSender<String>,
    failures: Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl QueueSession for LapinSession {
    async fn publish(&self, payload: &[u8]) -> Result<(), TransferError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY)
            .with_content_type(CONTENT_TYPE_JSON.into());

        let published = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await;

        let confirmation = match published {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };

        match confirmation {
            Ok(confirmation) if confirmation.is_nack() => Err(TransferError::Nacked {
                queue: self.queue.clone(),
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                if !self.channel.status().connected() {
                    let _ = self.failure_tx.send(format!("channel closed: {}", root_cause(&e)));
                }
                Err(TransferError::AmqpPublish(e))
            }
        }
    }

    async fn closed(&self) -> String {
        let mut failures = self.failures.lock().await;
        failures
            .recv()
            .await
            .unwrap_or_else(|| "connection dropped".to_string())
    }

    async fn close(&self) {
        if !self.connection.status().connected() {
            return;
        }
        if let Err(e) = self.connection.close(200, "shutdown").await {
            warn!("Error closing AMQP connection: {}", root_cause(&e));
        }
    }
}
