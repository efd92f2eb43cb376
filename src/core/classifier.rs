//! Per-sensor-type anomaly rules.
//!
//! A single table answers both questions the relay asks: whether to record an
//! anomaly next to the stored reading ([`Verdict::Storage`]) and which
//! `anomalie` flag to publish ([`Verdict::Outbound`]). The two only differ when
//! a rule names an `outbound_threshold`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::reading::SensorReading;
use crate::config::anomaly::AnomalyConfig;

pub const LIGHT_SENSOR: &str = "modulo de sensor de luz fotoresistencia ldr";
pub const AC_VOLTAGE_SENSOR: &str = "sensor de voltaje Ac Zmpt101b";
pub const CURRENT_SENSOR: &str = "modulo de sensor de corriente Acs712";

pub const LIGHT_THRESHOLD: f64 = 270.0;
/// Stricter light threshold applied to the published flag.
pub const LIGHT_OUTBOUND_THRESHOLD: f64 = 220.0;
pub const AC_VOLTAGE_THRESHOLD: f64 = 14.4;
pub const CURRENT_THRESHOLD: f64 = 6.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Below,
    AtOrBelow,
    Above,
    AtOrAbove,
}

impl Comparator {
    /// True when `value` is on the anomalous side of `threshold`.
    pub fn is_anomalous(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Below => value < threshold,
            Comparator::AtOrBelow => value <= threshold,
            Comparator::Above => value > threshold,
            Comparator::AtOrAbove => value >= threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Below => "<",
            Comparator::AtOrBelow => "<=",
            Comparator::Above => ">",
            Comparator::AtOrAbove => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Decides whether an anomaly row is recorded.
    Storage,
    /// Decides the `anomalie` flag of the published message.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorRule {
    pub comparator: Comparator,
    pub threshold: f64,
    /// Overrides `threshold` for [`Verdict::Outbound`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_threshold: Option<f64>,
}

impl SensorRule {
    pub fn below(threshold: f64) -> Self {
        Self {
            comparator: Comparator::Below,
            threshold,
            outbound_threshold: None,
        }
    }

    pub fn with_outbound_threshold(mut self, threshold: f64) -> Self {
        self.outbound_threshold = Some(threshold);
        self
    }

    pub fn threshold_for(&self, verdict: Verdict) -> f64 {
        match verdict {
            Verdict::Storage => self.threshold,
            Verdict::Outbound => self.outbound_threshold.unwrap_or(self.threshold),
        }
    }

    pub fn is_anomalous(&self, value: f64, verdict: Verdict) -> bool {
        self.comparator.is_anomalous(value, self.threshold_for(verdict))
    }
}

/// Rule table keyed by sensor type name (`nameSensor`).
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRules {
    rules: HashMap<String, SensorRule>,
}

impl AnomalyRules {
    /// An empty table: nothing is anomalous.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// The production table.
    pub fn builtin() -> Self {
        Self::empty()
            .with_rule(
                LIGHT_SENSOR,
                SensorRule::below(LIGHT_THRESHOLD).with_outbound_threshold(LIGHT_OUTBOUND_THRESHOLD),
            )
            .with_rule(AC_VOLTAGE_SENSOR, SensorRule::below(AC_VOLTAGE_THRESHOLD))
            .with_rule(CURRENT_SENSOR, SensorRule::below(CURRENT_THRESHOLD))
    }

    /// Configured rules replace the built-in table entirely; with none
    /// configured the built-in table is used.
    pub fn from_config(config: &AnomalyConfig) -> Self {
        if config.rules.is_empty() {
            return Self::builtin();
        }
        config
            .rules
            .iter()
            .fold(Self::empty(), |rules, entry| rules.with_rule(&entry.sensor, entry.rule))
    }

    pub fn with_rule(mut self, sensor: impl Into<String>, rule: SensorRule) -> Self {
        self.rules.insert(sensor.into(), rule);
        self
    }

    pub fn rule(&self, sensor: &str) -> Option<&SensorRule> {
        self.rules.get(sensor)
    }

    /// Rules sorted by sensor name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SensorRule)> {
        let mut rules: Vec<_> = self.rules.iter().map(|(k, v)| (k.as_str(), v)).collect();
        rules.sort_by(|a, b| a.0.cmp(b.0));
        rules.into_iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Storage verdict. Unknown sensor types are never anomalous.
    pub fn classify(&self, reading: &SensorReading) -> bool {
        self.classify_for(reading, Verdict::Storage)
    }

    pub fn classify_for(&self, reading: &SensorReading, verdict: Verdict) -> bool {
        self.rule(&reading.sensor_name)
            .is_some_and(|rule| rule.is_anomalous(reading.value, verdict))
    }
}

impl Default for AnomalyRules {
    fn default() -> Self {
        Self::builtin()
    }
}
