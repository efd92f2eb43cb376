//! Configuration of the MQTT subscriber link.
//!
//! ```toml
//! [mqtt]
//! url = "mqtt://broker.local:1883"
//! username = "bridge"
//! password = "secret"
//! topic = "sensors/readings"
//! qos = 1
//! keep_alive = 60
//! reconnect_delay = 5
//! ```
//!
//! When `url` is set it takes precedence over `host`/`port`. An `mqtts://` (or
//! `ssl://`) URL, or a `[mqtt.tls]` section, selects TLS:
//!
//! ```toml
//! [mqtt.tls]
//! ca_cert_path = "/etc/sensorbridge/ca.pem"
//! ```
//!
//! Without `ca_cert_path` the platform's root certificates are used.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::backoff::ReconnectConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL, e.g. `mqtt://broker:1883`. Overrides `host` and `port`.
    #[validate(length(min = 1, max = 2048, message = "MQTT url must not be empty"))]
    pub url: Option<String>,

    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Client identifier. Empty means a random UUID per process.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Topic filter the link subscribes to once per session.
    #[validate(
        length(min = 1, message = "Topic must not be empty"),
        custom(function = validate_topic_filter)
    )]
    pub topic: String,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    pub clean_session: bool,

    /// Capacity of the client's outgoing request channel.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Maximum incoming/outgoing packet size in bytes.
    #[validate(range(
        min = 64,
        max = 268_435_455,
        message = "Max packet size must be between 64 bytes and 256 MiB"
    ))]
    pub max_packet_size: Option<usize>,

    /// Enables TLS; certificate paths are optional.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    #[serde(flatten)]
    #[validate(nested)]
    pub reconnect: ReconnectConfig,
}

/// PEM files for the TLS transport. Read when the client is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = validate_client_auth))]
pub struct TlsConfig {
    /// CA used to verify the broker. Platform roots when unset.
    pub ca_cert_path: Option<String>,

    /// Client certificate for mutual TLS, paired with `client_key_path`.
    pub client_cert_path: Option<String>,

    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }
}

fn validate_client_auth(tls: &TlsConfig) -> Result<(), ValidationError> {
    if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
        let mut err = ValidationError::new("client_auth_pair");
        err.message =
            Some("client_cert_path and client_key_path must be set together".into());
        return Err(err);
    }
    if tls.has_client_auth() && tls.ca_cert_path.is_none() {
        let mut err = ValidationError::new("client_auth_without_ca");
        err.message = Some("Client authentication requires ca_cert_path".into());
        return Err(err);
    }
    Ok(())
}

fn validate_topic_filter(topic: &str) -> Result<(), ValidationError> {
    let levels: Vec<&str> = topic.split('/').collect();
    let last = levels.len() - 1;
    let misplaced_hash = levels
        .iter()
        .enumerate()
        .any(|(i, level)| level.contains('#') && (*level != "#" || i != last));
    let partial_plus = levels
        .iter()
        .any(|level| level.contains('+') && *level != "+");

    if misplaced_hash || partial_plus {
        let mut err = ValidationError::new("invalid_topic_filter");
        err.message = Some(format!("Invalid MQTT topic filter: {topic}").into());
        return Err(err);
    }
    Ok(())
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            topic: "sensors/readings".to_string(),
            qos: 1,
            keep_alive: 60,
            clean_session: true,
            request_channel_capacity: 10,
            max_packet_size: None,
            tls: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MqttConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let config = MqttConfig {
            qos: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topic_filter_validation() {
        for ok in ["sensors/#", "sensors/+/value", "#", "a/b/c"] {
            assert!(validate_topic_filter(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["sensors/#/value", "sensors/x+", "a#"] {
            assert!(validate_topic_filter(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_reconnect_settings_are_flattened() {
        let config: MqttConfig = toml::from_str(
            r#"
            topic = "plant/sensors"
            reconnect_delay = 7
            reconnect_multiplier = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.topic, "plant/sensors");
        assert_eq!(config.reconnect.delay, 7);
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert_eq!(config.port, 1883);
    }

    #[test]
    fn test_tls_section_parsed_and_validated() {
        let config: MqttConfig = toml::from_str(
            r#"
            host = "broker.example.com"
            port = 8883

            [tls]
            ca_cert_path = "/etc/sensorbridge/ca.pem"
            "#,
        )
        .unwrap();
        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.ca_cert_path.as_deref(), Some("/etc/sensorbridge/ca.pem"));
        assert!(!tls.has_client_auth());
        assert!(config.validate().is_ok());

        let unpaired = MqttConfig {
            tls: Some(TlsConfig {
                ca_cert_path: Some("/ca.pem".into()),
                client_cert_path: Some("/client.crt".into()),
                client_key_path: None,
            }),
            ..Default::default()
        };
        assert!(unpaired.validate().is_err());
    }
}
