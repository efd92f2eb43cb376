//! Self-healing MQTT subscriber.
//!
//! [`SubscriberLink`] owns a [`SubscribeTransport`] and keeps one subscription
//! alive for as long as the process runs. Every session subscribes exactly
//! once; every inbound PUBLISH is forwarded, in order, to a bounded channel that
//! is wired once at construction, so reconnects never duplicate delivery.
//!
//! ```ignore
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let link = SubscriberLink::from_config(&config.mqtt, tx, cancel.child_token())?;
//! let mut state = link.subscribe_state();
//! tokio::spawn(link.run());
//!
//! while let Some(message) = rx.recv().await {
//!     // handle message.payload
//! }
//! ```

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

use super::{
    config::MqttConfig,
    state::SubscriberState,
    transport::{InboundMessage, MqttTransport, SubscribeTransport},
};
use crate::{
    backoff::Backoff,
    error::{root_cause, TransferError},
};

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Connection error or close; the link reconnects after the backoff delay.
    Failed(String),
    /// The delivery channel receiver was dropped; nothing left to deliver to.
    ConsumerGone,
}

pub struct SubscriberLink<T: SubscribeTransport> {
    transport: T,
    topic: String,
    backoff: Backoff,
    deliver: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    state_tx: watch::Sender<SubscriberState>,
    state_rx: watch::Receiver<SubscriberState>,
}

impl SubscriberLink<MqttTransport> {
    /// Validates `config` and builds a link over a `rumqttc` transport.
    pub fn from_config(
        config: &MqttConfig,
        deliver: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        let transport = MqttTransport::from_config(config)?;
        Ok(Self::new(
            transport,
            config.topic.clone(),
            Backoff::from_config(&config.reconnect),
            deliver,
            cancel,
        ))
    }
}

impl<T: SubscribeTransport> SubscriberLink<T> {
    pub fn new(
        transport: T,
        topic: impl Into<String>,
        backoff: Backoff,
        deliver: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SubscriberState::default());
        Self {
            transport,
            topic: topic.into(),
            backoff,
            deliver,
            cancel,
            state_tx,
            state_rx,
        }
    }

    /// Receiver that observes every state change of the link.
    pub fn subscribe_state(&self) -> watch::Receiver<SubscriberState> {
        self.state_rx.clone()
    }

    fn update_state(&self, state: SubscriberState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            info!(topic = %self.topic, "Subscriber state changed to: {}", state);
            self.state_tx.send_replace(state);
        }
    }

    /// Runs sessions until the cancellation token fires or the delivery
    /// channel is closed.
    ///
    /// Each failed or closed session schedules exactly one new attempt after
    /// the backoff delay. There is no retry limit.
    pub async fn run(mut self) {
        info!(topic = %self.topic, "Starting subscriber link");
        let cancel = self.cancel.clone();

        loop {
            self.update_state(SubscriberState::Connecting);

            let end = tokio::select! {
                _ = cancel.cancelled() => None,
                end = self.run_session() => Some(end),
            };

            let reason = match end {
                Some(SessionEnd::Failed(reason)) => reason,
                Some(SessionEnd::ConsumerGone) => {
                    warn!("Delivery channel closed, stopping subscriber link");
                    break;
                }
                None => break,
            };

            self.update_state(SubscriberState::Disconnected(reason.clone()));
            let delay = self.backoff.next_sleep();
            warn!(
                attempt = self.backoff.attempt(),
                "Reconnecting to MQTT broker in {:.2} seconds due to error: {}",
                delay.as_secs_f64(),
                reason
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Disconnecting from MQTT broker...");
        self.transport.disconnect().await;
        self.update_state(SubscriberState::Disconnected("shutdown".into()));
        info!("Subscriber link stopped");
    }

    async fn run_session(&mut self) -> SessionEnd {
        if let Err(e) = self.transport.connect().await {
            return SessionEnd::Failed(root_cause(&e));
        }
        self.backoff.reset();
        self.update_state(SubscriberState::Subscribed);

        match self.transport.subscribe(&self.topic).await {
            Ok(()) => debug!(topic = %self.topic, "Subscription requested"),
            Err(e) => error!("Subscribe failed, continuing without it: {}", e),
        }

        loop {
            let message = match self.transport.next_message().await {
                Ok(message) => message,
                Err(e) => return SessionEnd::Failed(root_cause(&e)),
            };

            match self.deliver.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    warn!("Delivery channel full, pausing subscription");
                    if self.deliver.send(message).await.is_err() {
                        return SessionEnd::ConsumerGone;
                    }
                    info!("Delivery channel has capacity, resuming subscription");
                }
                Err(TrySendError::Closed(_)) => return SessionEnd::ConsumerGone,
            }
        }
    }
}
