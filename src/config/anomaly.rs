//! `[anomaly]` section.
//!
//! ```toml
//! [[anomaly.rules]]
//! sensor = "modulo de sensor de luz fotoresistencia ldr"
//! comparator = "below"
//! threshold = 270
//! outbound_threshold = 220
//! ```
//!
//! When at least one rule is given the built-in table is replaced, not merged.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::classifier::SensorRule;

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AnomalyConfig {
    #[validate(nested)]
    pub rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RuleEntry {
    /// Exact `nameSensor` value the rule applies to.
    #[validate(length(min = 1, message = "Rule sensor name must not be empty"))]
    pub sensor: String,

    #[serde(flatten)]
    pub rule: SensorRule,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::Comparator;

    #[test]
    fn test_parse_rules() {
        let config: AnomalyConfig = toml::from_str(
            r#"
            [[rules]]
            sensor = "modulo de sensor de luz fotoresistencia ldr"
            comparator = "below"
            threshold = 270
            outbound_threshold = 220

            [[rules]]
            sensor = "thermistor"
            comparator = "at_or_above"
            threshold = 85.5
            "#,
        )
        .unwrap();

        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].rule.threshold, 270.0);
        assert_eq!(config.rules[0].rule.outbound_threshold, Some(220.0));
        assert_eq!(config.rules[1].rule.comparator, Comparator::AtOrAbove);
        assert_eq!(config.rules[1].rule.outbound_threshold, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_sensor_name_invalid() {
        let config = AnomalyConfig {
            rules: vec![RuleEntry {
                sensor: String::new(),
                rule: SensorRule::below(1.0),
            }],
        };
        assert!(config.validate().is_err());
    }
}
