//! Self-healing publisher for one durable queue.
//!
//! [`QueuePublisherLink::run`] keeps a session open and reopens it after the
//! backoff delay whenever it closes. [`QueueHandle`] is the cloneable publish
//! side given to the relay: it only reaches the network while the link is
//! `Ready`.

use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

use super::{
    config::AmqpConfig,
    state::PublisherState,
    transport::{LapinConnector, QueueConnector, QueueSession},
};
use crate::{backoff::Backoff, error::TransferError};

/// State shared between the link task and its handles.
struct Shared {
    session: RwLock<Option<Arc<dyn QueueSession>>>,
    state_tx: watch::Sender<PublisherState>,
}

pub struct QueuePublisherLink<C: QueueConnector> {
    connector: C,
    queue: String,
    backoff: Backoff,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl QueuePublisherLink<LapinConnector> {
    /// Validates `config` and builds a link over a `lapin` connector.
    pub fn from_config(config: &AmqpConfig, cancel: CancellationToken) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self::new(
            LapinConnector::new(config.clone()),
            config.queue.clone(),
            Backoff::from_config(&config.reconnect),
            cancel,
        ))
    }
}

impl<C: QueueConnector> QueuePublisherLink<C> {
    pub fn new(
        connector: C,
        queue: impl Into<String>,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(PublisherState::default());
        Self {
            connector,
            queue: queue.into(),
            backoff,
            cancel,
            shared: Arc::new(Shared {
                session: RwLock::new(None),
                state_tx,
            }),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PublisherState> {
        self.shared.state_tx.subscribe()
    }

    fn update_state(&self, state: PublisherState) {
        let changed = *self.shared.state_tx.borrow() != state;
        if changed {
            info!(queue = %self.queue, "Publisher state changed to: {}", state);
            self.shared.state_tx.send_replace(state);
        }
    }

    /// Opens sessions until the cancellation token fires.
    ///
    /// A failure in any setup step (connect, channel, declare) or the loss of
    /// an open session schedules exactly one new attempt after the backoff
    /// delay. There is no retry limit.
    pub async fn run(mut self) {
        info!(queue = %self.queue, "Starting queue publisher link");
        let cancel = self.cancel.clone();

        loop {
            self.update_state(PublisherState::Connecting);

            let reason = tokio::select! {
                _ = cancel.cancelled() => break,
                reason = self.run_session() => reason,
            };

            self.update_state(PublisherState::Disconnected(reason.clone()));
            let delay = self.backoff.next_sleep();
            warn!(
                attempt = self.backoff.attempt(),
                "Reconnecting to AMQP broker in {:.2} seconds due to error: {}",
                delay.as_secs_f64(),
                reason
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shutdown().await;
    }

    /// Runs one session and returns why it ended.
    async fn run_session(&mut self) -> String {
        let session = match self.connector.open().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to open AMQP session: {}", e);
                return e.to_string();
            }
        };

        self.backoff.reset();
        *self.shared.session.write().await = Some(session.clone());
        self.update_state(PublisherState::Ready);

        let reason = session.closed().await;
        self.shared.session.write().await.take();
        reason
    }

    async fn shutdown(&self) {
        info!("Shutdown signal received, closing AMQP connection...");
        let session = self.shared.session.write().await.take();
        self.update_state(PublisherState::Disconnected("shutdown".into()));
        if let Some(session) = session {
            session.close().await;
        }
        info!("Queue publisher link stopped");
    }
}

/// Cloneable publish side of a [`QueuePublisherLink`].
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    pub fn state(&self) -> PublisherState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PublisherState> {
        self.shared.state_tx.subscribe()
    }

    /// Publishes `payload` as one persistent message.
    ///
    /// Fails with [`TransferError::NotReady`] without touching the network
    /// when the link is not `Ready`.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), TransferError> {
        let session = self.shared.session.read().await.clone();
        let state = self.state();

        match session {
            Some(session) if state.is_ready() => session.publish(payload).await,
            _ => {
                debug!(state = %state, "Publish attempted while link not ready");
                Err(TransferError::NotReady {
                    state: state.to_string(),
                })
            }
        }
    }
}
