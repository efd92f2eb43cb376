//! Hands inbound messages to the relay, one task per message.
//!
//! At most `max_in_flight` relays run at once. A permit is taken before the next
//! message is received, so a saturated relay leaves messages in the bounded
//! delivery channel and the subscriber link pauses. Messages from the same
//! sensor are not serialized and may be stored out of arrival order.

use std::{sync::Arc, time::Duration};

use sensorbridge_transport::mqtt::InboundMessage;
use tokio::{
    sync::{mpsc, Semaphore},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{readiness::Readiness, relay::MessageRelay};
use crate::config::relay::RelayConfig;

const READINESS_REMINDER: Duration = Duration::from_secs(30);

/// Outcome of a dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    /// Every in-flight relay finished before the drain timeout.
    pub drained: bool,
}

pub struct Dispatcher {
    relay: Arc<MessageRelay>,
    inbound: mpsc::Receiver<InboundMessage>,
    permits: Arc<Semaphore>,
    max_in_flight: u32,
    drain_timeout: Duration,
    readiness: Readiness,
}

impl Dispatcher {
    pub fn new(
        relay: Arc<MessageRelay>,
        inbound: mpsc::Receiver<InboundMessage>,
        config: &RelayConfig,
        readiness: Readiness,
    ) -> Self {
        let max_in_flight = u32::try_from(config.max_in_flight.max(1)).unwrap_or(u32::MAX);
        Self {
            relay,
            inbound,
            permits: Arc::new(Semaphore::new(max_in_flight as usize)),
            max_in_flight,
            drain_timeout: config.drain_timeout(),
            readiness,
        }
    }

    /// Runs until `cancel` fires or the delivery channel closes, then drains.
    pub async fn run(mut self, cancel: CancellationToken) -> DispatchStats {
        let mut stats = DispatchStats::default();

        if !self.wait_ready(&cancel).await {
            stats.drained = true;
            return stats;
        }
        info!("Dispatching messages (max in flight: {})", self.max_in_flight);

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.inbound.recv() => match message {
                    Some(message) => message,
                    None => {
                        warn!("Delivery channel closed");
                        break;
                    }
                },
            };

            stats.dispatched += 1;
            let relay = self.relay.clone();
            let span = info_span!("relay", topic = %message.topic);
            tokio::spawn(
                async move {
                    relay.on_message(&message.payload).await;
                    drop(permit);
                }
                .instrument(span),
            );
        }

        self.inbound.close();
        stats.drained = self.drain().await;
        stats
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.readiness.subscribe();
        if rx.borrow_and_update().is_ready() {
            return true;
        }

        warn!("Waiting for readiness... Current: {}", *rx.borrow());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let state = rx.borrow_and_update().clone();
                    if state.is_ready() {
                        info!("Both links are up");
                        return true;
                    }
                    debug!("Still not ready: {}", state);
                }
                _ = sleep(READINESS_REMINDER) => {
                    warn!("Still waiting for readiness... Current: {}", *rx.borrow());
                }
            }
        }
    }

    async fn drain(&self) -> bool {
        let in_flight = self.max_in_flight as usize - self.permits.available_permits();
        if in_flight == 0 {
            return true;
        }

        info!("Waiting for {} in-flight message(s)...", in_flight);
        match timeout(self.drain_timeout, self.permits.acquire_many(self.max_in_flight)).await {
            Ok(_) => {
                info!("In-flight messages drained");
                true
            }
            Err(_) => {
                warn!(
                    "Drain timed out after {:?}, abandoning in-flight messages",
                    self.drain_timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::{
        classifier::AnomalyRules,
        readiness::ReadinessState,
        reading::Identifier,
        relay::tests::{FakeGateway, FakePublisher},
    };

    fn message(sensor_id: i64, valor: i64) -> InboundMessage {
        let payload = format!(
            r#"{{"sensorId":{sensor_id},"valor":{valor},"nameSensor":"sensor de voltaje Ac Zmpt101b","codeOfProduct":1}}"#
        );
        InboundMessage {
            topic: "sensors/readings".into(),
            payload: Bytes::from(payload),
        }
    }

    fn config(max_in_flight: usize, drain_timeout_secs: u64) -> RelayConfig {
        RelayConfig {
            channel_capacity: 16,
            max_in_flight,
            drain_timeout_secs,
        }
    }

    fn ready() -> Readiness {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Ready);
        readiness
    }

    fn dispatcher(
        gateway: &Arc<FakeGateway>,
        publisher: &Arc<FakePublisher>,
        config: &RelayConfig,
        readiness: Readiness,
    ) -> (Dispatcher, mpsc::Sender<InboundMessage>) {
        let relay = Arc::new(MessageRelay::new(
            gateway.clone(),
            Arc::new(AnomalyRules::builtin()),
            publisher.clone(),
        ));
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        (Dispatcher::new(relay, rx, config, readiness), tx)
    }

    fn saved_ids(gateway: &FakeGateway) -> Vec<Identifier> {
        gateway
            .saved
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.sensor_id.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_every_message_until_channel_closes() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(4, 10), ready());

        for id in 1..=5 {
            tx.send(message(id, id)).await.unwrap();
        }
        drop(tx);

        let stats = dispatcher.run(CancellationToken::new()).await;
        assert_eq!(stats, DispatchStats { dispatched: 5, drained: true });
        assert_eq!(gateway.saved.lock().unwrap().len(), 5);
        assert_eq!(publisher.published.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_is_bounded() {
        let delays: HashMap<i64, Duration> =
            (1..=4).map(|id| (id, Duration::from_secs(1))).collect();
        let gateway = Arc::new(FakeGateway {
            delays,
            ..Default::default()
        });
        let publisher = Arc::new(FakePublisher::default());
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(2, 10), ready());

        for id in 1..=4 {
            tx.send(message(id, id)).await.unwrap();
        }
        drop(tx);

        let start = Instant::now();
        let stats = dispatcher.run(CancellationToken::new()).await;

        // Two at a time, one second each.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(stats.dispatched, 4);
        assert!(stats.drained);
        assert_eq!(gateway.saved.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_sensor_may_complete_out_of_order() {
        let gateway = Arc::new(FakeGateway {
            delays: HashMap::from([(1, Duration::from_millis(500))]),
            ..Default::default()
        });
        let publisher = Arc::new(FakePublisher::default());
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(4, 10), ready());

        // Sensor 7's first reading is slow to store; its second one overtakes it.
        tx.send(message(7, 1)).await.unwrap();
        tx.send(message(7, 2)).await.unwrap();
        drop(tx);

        dispatcher.run(CancellationToken::new()).await;

        let saved = gateway.saved.lock().unwrap();
        let values: Vec<f64> = saved.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2.0, 1.0]);
        assert!(saved.iter().all(|r| r.sensor_id == Identifier::Int(7)));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_shutdown_drains_in_flight() {
        let gateway = Arc::new(FakeGateway {
            delays: HashMap::from([(20, Duration::from_secs(3))]),
            ..Default::default()
        });
        let publisher = Arc::new(FakePublisher::default());
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(4, 10), ready());
        let cancel = CancellationToken::new();

        tx.send(message(1, 20)).await.unwrap();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()).in_current_span());
        sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats, DispatchStats { dispatched: 1, drained: true });
        assert_eq!(saved_ids(&gateway), vec![Identifier::Int(1)]);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
        assert!(logs_contain("Waiting for 1 in-flight message(s)"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_drain_gives_up_after_timeout() {
        let gateway = Arc::new(FakeGateway {
            delays: HashMap::from([(20, Duration::from_secs(60))]),
            ..Default::default()
        });
        let publisher = Arc::new(FakePublisher::default());
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(4, 2), ready());
        let cancel = CancellationToken::new();

        tx.send(message(1, 20)).await.unwrap();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()).in_current_span());
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let start = Instant::now();
        let stats = handle.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(!stats.drained);
        assert!(logs_contain("Drain timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_readiness() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());
        let readiness = Readiness::new();
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(4, 10), readiness.clone());

        tx.send(message(1, 20)).await.unwrap();
        drop(tx);
        let handle = tokio::spawn(dispatcher.run(CancellationToken::new()));

        sleep(Duration::from_secs(5)).await;
        assert!(gateway.saved.lock().unwrap().is_empty());

        readiness.set_state(ReadinessState::Ready);
        let stats = handle.await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(saved_ids(&gateway), vec![Identifier::Int(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_ready_dispatches_nothing() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());
        let (dispatcher, tx) = dispatcher(&gateway, &publisher, &config(4, 10), Readiness::new());
        let cancel = CancellationToken::new();

        tx.send(message(1, 20)).await.unwrap();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()).in_current_span());
        sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats, DispatchStats { dispatched: 0, drained: true });
        assert!(gateway.saved.lock().unwrap().is_empty());
    }
}
