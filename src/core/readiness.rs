//! Combined readiness of the two broker links.
//!
//! The bridge is `Ready` only while the subscriber link is `Subscribed` and the
//! publisher link is `Ready`. The dispatcher waits for this before it starts
//! handing messages to the relay.

use std::fmt;

use sensorbridge_transport::{amqp::PublisherState, mqtt::SubscriberState};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Ready,
    NotReadyYet(String),
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::NotReadyYet(reason) => write!(f, "NotReadyYet: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Maps the two link states to one readiness state.
pub fn combine(subscriber: &SubscriberState, publisher: &PublisherState) -> ReadinessState {
    match (subscriber.is_subscribed(), publisher.is_ready()) {
        (true, true) => ReadinessState::Ready,
        (false, true) => ReadinessState::NotReadyYet(format!("MQTT {subscriber}")),
        (true, false) => ReadinessState::NotReadyYet(format!("AMQP {publisher}")),
        (false, false) => {
            ReadinessState::NotReadyYet(format!("MQTT {subscriber}, AMQP {publisher}"))
        }
    }
}

/// Follows both link state channels until either link stops.
pub async fn listen(
    mut subscriber_rx: watch::Receiver<SubscriberState>,
    mut publisher_rx: watch::Receiver<PublisherState>,
    state_tx: watch::Sender<ReadinessState>,
) {
    debug!("Listening to link states");

    loop {
        let state = combine(&subscriber_rx.borrow_and_update(), &publisher_rx.borrow_and_update());
        state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("The readiness status has changed: {} -> {}", current, state);
            *current = state;
            true
        });

        let changed = tokio::select! {
            r = subscriber_rx.changed() => r,
            r = publisher_rx.changed() => r,
        };
        if changed.is_err() {
            break;
        }
    }

    debug!("Link state channel closed, listening stopped");
}

/// Shared readiness tracker.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
    state_rx: watch::Receiver<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Unknown);
        Self { state_tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_rx.clone()
    }

    /// Spawns the task that derives readiness from the two link states.
    pub fn start_listening(
        &self,
        subscriber_rx: watch::Receiver<SubscriberState>,
        publisher_rx: watch::Receiver<PublisherState>,
    ) {
        let state_tx = self.state_tx.clone();
        tokio::spawn(listen(subscriber_rx, publisher_rx, state_tx));
    }

    pub fn set_state(&self, state: ReadinessState) {
        let old_state = self.state_tx.send_replace(state.clone());
        debug!("The readiness status has changed: {} -> {}", old_state, state);
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
