//! One inbound payload, end to end: parse, persist, classify, publish.
//!
//! Every successfully parsed reading gets exactly one `save` attempt followed by
//! exactly one `publish` attempt, whatever the classification and whatever
//! happened to the save. Nothing is retried and no failure escapes
//! [`MessageRelay::on_message`].

use std::sync::Arc;

use async_trait::async_trait;
use sensorbridge_transport::{amqp::QueueHandle, TransferError};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::{
    classifier::{AnomalyRules, Verdict},
    persistence::{PersistenceGateway, ReadingId},
    reading::{OutboundReading, SensorReading},
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid reading payload: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to encode outbound reading: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Publish side seen by the relay.
#[async_trait]
pub trait OutboundPublisher: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<(), TransferError>;
}

#[async_trait]
impl OutboundPublisher for QueueHandle {
    async fn publish(&self, payload: &[u8]) -> Result<(), TransferError> {
        QueueHandle::publish(self, payload).await
    }
}

/// What happened to one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub parsed: bool,
    pub persisted: Option<ReadingId>,
    pub anomaly_recorded: bool,
    /// Outbound `anomalie` flag, when a message was built.
    pub anomalie: Option<bool>,
    pub published: bool,
}

pub struct MessageRelay {
    gateway: Arc<dyn PersistenceGateway>,
    rules: Arc<AnomalyRules>,
    publisher: Arc<dyn OutboundPublisher>,
}

impl MessageRelay {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        rules: Arc<AnomalyRules>,
        publisher: Arc<dyn OutboundPublisher>,
    ) -> Self {
        Self {
            gateway,
            rules,
            publisher,
        }
    }

    pub async fn on_message(&self, payload: &[u8]) -> RelayReport {
        let mut report = RelayReport::default();

        let reading = match SensorReading::from_slice(payload).map_err(RelayError::Parse) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    payload = %String::from_utf8_lossy(payload),
                    "Dropping message: {}", e
                );
                return report;
            }
        };
        report.parsed = true;
        debug!(
            sensor_id = %reading.sensor_id,
            sensor = %reading.sensor_name,
            value = reading.value,
            "Reading received"
        );

        self.persist(&reading, &mut report).await;
        self.forward(&reading, &mut report).await;
        report
    }

    async fn persist(&self, reading: &SensorReading, report: &mut RelayReport) {
        let reading_id = match self.gateway.save(reading).await {
            Ok(id) => id,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        report.persisted = Some(reading_id);
        debug!(reading_id, "Reading stored");

        if !self.rules.classify_for(reading, Verdict::Storage) {
            return;
        }
        match self.gateway.record_anomaly(reading_id).await {
            Ok(()) => {
                report.anomaly_recorded = true;
                info!(
                    reading_id,
                    sensor = %reading.sensor_name,
                    value = reading.value,
                    "Anomaly recorded"
                );
            }
            Err(e) => error!("{}", e),
        }
    }

    async fn forward(&self, reading: &SensorReading, report: &mut RelayReport) {
        let anomalie = self.rules.classify_for(reading, Verdict::Outbound);
        report.anomalie = Some(anomalie);

        let outbound = OutboundReading::new(reading, anomalie, OffsetDateTime::now_utc());
        let bytes = match outbound.to_vec().map_err(RelayError::Encode) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        match self.publisher.publish(&bytes).await {
            Ok(()) => {
                report.published = true;
                debug!(sensor_id = %reading.sensor_id, anomalie, "Reading published");
            }
            Err(e) => error!(sensor_id = %reading.sensor_id, "Dropping outbound reading: {}", e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use serde_json::Value;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::{classifier::LIGHT_SENSOR, persistence::PersistenceError, reading::Identifier};

    /// Records every call; `save` can be made to fail, or to take time for a given `valor`.
    #[derive(Default)]
    pub(crate) struct FakeGateway {
        pub fail_save: bool,
        pub fail_anomaly: bool,
        pub delays: HashMap<i64, Duration>,
        pub next_id: AtomicU64,
        pub saved: Mutex<Vec<SensorReading>>,
        pub anomalies: Mutex<Vec<ReadingId>>,
    }

    #[async_trait]
    impl PersistenceGateway for FakeGateway {
        async fn save(&self, reading: &SensorReading) -> Result<ReadingId, PersistenceError> {
            if let Some(delay) = self.delays.get(&(reading.value as i64)) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail_save {
                return Err(PersistenceError::Save {
                    sensor_id: reading.sensor_id.to_string(),
                    source: sqlx::Error::PoolTimedOut,
                });
            }
            self.saved.lock().unwrap().push(reading.clone());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        }

        async fn record_anomaly(&self, reading_id: ReadingId) -> Result<(), PersistenceError> {
            self.anomalies.lock().unwrap().push(reading_id);
            if self.fail_anomaly {
                return Err(PersistenceError::RecordAnomaly {
                    reading_id,
                    source: sqlx::Error::PoolClosed,
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakePublisher {
        pub not_ready: bool,
        pub published: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl OutboundPublisher for FakePublisher {
        async fn publish(&self, payload: &[u8]) -> Result<(), TransferError> {
            if self.not_ready {
                return Err(TransferError::NotReady {
                    state: "Connecting".into(),
                });
            }
            let value = serde_json::from_slice(payload).unwrap();
            self.published.lock().unwrap().push(value);
            Ok(())
        }
    }

    fn relay(gateway: &Arc<FakeGateway>, publisher: &Arc<FakePublisher>) -> MessageRelay {
        MessageRelay::new(
            gateway.clone(),
            Arc::new(AnomalyRules::builtin()),
            publisher.clone(),
        )
    }

    const LDR_200: &[u8] =
        br#"{"sensorId":7,"valor":200,"nameSensor":"modulo de sensor de luz fotoresistencia ldr","codeOfProduct":3}"#;

    #[tokio::test]
    async fn test_light_reading_end_to_end() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());

        let report = relay(&gateway, &publisher).on_message(LDR_200).await;

        assert_eq!(
            report,
            RelayReport {
                parsed: true,
                persisted: Some(100),
                anomaly_recorded: true,
                anomalie: Some(true),
                published: true,
            }
        );

        let saved = gateway.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].sensor_id, Identifier::Int(7));
        assert_eq!(saved[0].sensor_name, LIGHT_SENSOR);
        assert_eq!(*gateway.anomalies.lock().unwrap(), vec![100]);

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["sensorId"], 7);
        assert_eq!(published[0]["valor"], 200);
        assert_eq!(published[0]["codeOfProduct"], 3);
        assert_eq!(published[0]["anomalie"], true);
        assert!(published[0]["createdAt"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_storage_and_outbound_verdicts_evaluated_separately() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());

        // 250 is below the storage threshold (270) but not the outbound one (220).
        let payload = br#"{"sensorId":7,"valor":250,"nameSensor":"modulo de sensor de luz fotoresistencia ldr","codeOfProduct":3}"#;
        let report = relay(&gateway, &publisher).on_message(payload).await;

        assert!(report.anomaly_recorded);
        assert_eq!(report.anomalie, Some(false));
        assert_eq!(publisher.published.lock().unwrap()[0]["anomalie"], false);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unparseable_payload_touches_nothing() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());
        let relay = relay(&gateway, &publisher);

        for payload in [&b"{not json"[..], &br#"{"sensorId":1}"#[..], &b""[..]] {
            let report = relay.on_message(payload).await;
            assert_eq!(report, RelayReport::default());
        }

        assert!(gateway.saved.lock().unwrap().is_empty());
        assert!(gateway.anomalies.lock().unwrap().is_empty());
        assert!(publisher.published.lock().unwrap().is_empty());
        assert!(logs_contain("Dropping message"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_save_failure_still_publishes() {
        let gateway = Arc::new(FakeGateway {
            fail_save: true,
            ..Default::default()
        });
        let publisher = Arc::new(FakePublisher::default());

        let report = relay(&gateway, &publisher).on_message(LDR_200).await;

        assert_eq!(report.persisted, None);
        assert!(!report.anomaly_recorded);
        assert!(report.published);
        assert!(gateway.anomalies.lock().unwrap().is_empty());
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
        assert!(logs_contain("Failed to store reading from sensor 7"));
    }

    #[tokio::test]
    async fn test_normal_reading_records_no_anomaly() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher::default());

        let payload = br#"{"sensorId":2,"valor":220.5,"nameSensor":"sensor de voltaje Ac Zmpt101b","codeOfProduct":9}"#;
        let report = relay(&gateway, &publisher).on_message(payload).await;

        assert_eq!(report.persisted, Some(100));
        assert!(!report.anomaly_recorded);
        assert!(gateway.anomalies.lock().unwrap().is_empty());
        assert_eq!(publisher.published.lock().unwrap()[0]["anomalie"], false);
    }

    #[tokio::test]
    async fn test_anomaly_record_failure_still_publishes() {
        let gateway = Arc::new(FakeGateway {
            fail_anomaly: true,
            ..Default::default()
        });
        let publisher = Arc::new(FakePublisher::default());

        let report = relay(&gateway, &publisher).on_message(LDR_200).await;

        assert_eq!(report.persisted, Some(100));
        assert!(!report.anomaly_recorded);
        assert_eq!(*gateway.anomalies.lock().unwrap(), vec![100]);
        assert!(report.published);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_publish_not_ready_is_dropped() {
        let gateway = Arc::new(FakeGateway::default());
        let publisher = Arc::new(FakePublisher {
            not_ready: true,
            ..Default::default()
        });

        let report = relay(&gateway, &publisher).on_message(LDR_200).await;

        assert_eq!(report.persisted, Some(100));
        assert!(!report.published);
        assert!(logs_contain("Dropping outbound reading"));
    }
}
