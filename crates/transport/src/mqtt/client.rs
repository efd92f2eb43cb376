//! Builds the `rumqttc` client and event loop from [`MqttConfig`].
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?.build();
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, TlsConfiguration, Transport};
use url::{Host, Url};

use super::config::{MqttConfig, TlsConfig};
use crate::error::TransferError;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Accumulates `MqttOptions` and the request channel capacity.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
}

impl ClientBuilder {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
        }
    }

    /// Creates a builder from validated configuration.
    ///
    /// An empty `client_id` is replaced by a random UUID. When `url` is set it
    /// overrides `host`/`port`, and its userinfo is used unless `username` or
    /// `password` are configured.
    pub fn from_config(config: &MqttConfig) -> Result<Self, TransferError> {
        let client_id = if config.client_id.is_empty() {
            format!("sensorbridge-{}", uuid::Uuid::new_v4().simple())
        } else {
            config.client_id.clone()
        };

        let broker = match &config.url {
            Some(url) => parse_broker_url(url)?,
            None => BrokerUrl {
                host: config.host.clone(),
                port: config.port,
                tls: false,
                username: None,
                password: None,
            },
        };

        let mut builder = Self::new(client_id, broker.host, broker.port, config.request_channel_capacity);
        builder.opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        builder.opts.set_clean_session(config.clean_session);

        if let Some(max_packet_size) = config.max_packet_size {
            builder.opts.set_max_packet_size(max_packet_size, max_packet_size);
        }

        match (&config.tls, broker.tls) {
            (Some(tls), _) => builder = builder.tls(build_tls_transport(tls)?),
            (None, true) => builder = builder.tls(Transport::tls_with_default_config()),
            (None, false) => {}
        }

        let username = config.username.clone().or(broker.username);
        if let Some(username) = username {
            let password = config.password.clone().or(broker.password).unwrap_or_default();
            builder = builder.credentials(username, password);
        }
        Ok(builder)
    }

    /// Sets broker credentials, sent in the CONNECT packet.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn tls(mut self, transport: Transport) -> Self {
        self.opts.set_transport(transport);
        self
    }

    pub fn options(&self) -> &MqttOptions {
        &self.opts
    }

    /// Consumes the builder. The returned event loop must be polled for the
    /// client's requests to reach the broker.
    pub fn build(self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.opts, self.cap)
    }
}

/// Broker location taken from `MqttConfig::url`.
#[derive(Debug, PartialEq, Eq)]
struct BrokerUrl {
    host: String,
    port: u16,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
}

/// Parses `mqtt://` or `tcp://` for plain connections and `mqtts://`, `ssl://`
/// or `tls://` for TLS. The port defaults to 1883, or 8883 with TLS.
fn parse_broker_url(raw: &str) -> Result<BrokerUrl, TransferError> {
    let invalid = |reason: String| TransferError::ClientSetup(format!("Invalid MQTT url '{raw}': {reason}"));

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" | "tls" => true,
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(invalid("missing host".to_string())),
    };

    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    let username = Some(url.username()).filter(|u| !u.is_empty()).map(str::to_string);
    let password = url.password().map(str::to_string);

    Ok(BrokerUrl {
        host,
        port,
        tls,
        username,
        password,
    })
}

fn build_tls_transport(tls: &TlsConfig) -> Result<Transport, TransferError> {
    let Some(ca_path) = &tls.ca_cert_path else {
        return Ok(Transport::tls_with_default_config());
    };
    let ca = load_file(ca_path)?;

    let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert_path), Some(key_path)) => Some((load_file(cert_path)?, load_file(key_path)?)),
        _ => None,
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
    fs::read(path).map_err(|e| TransferError::ClientSetup(format!("Failed to read '{path}': {e}")))
}

/// Maps the configured numeric QoS to the protocol enum.
pub fn qos_from_level(level: u8) -> Result<QoS, TransferError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::ClientSetup(format!(
            "Invalid QoS level {other}, must be 0, 1 or 2"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_uses_host_and_port() {
        let config = MqttConfig {
            host: "broker.local".into(),
            port: 1884,
            client_id: "bridge-1".into(),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(
            builder.options().broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(builder.options().client_id(), "bridge-1");
        assert_eq!(builder.options().keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_config_url_overrides_host() {
        let config = MqttConfig {
            url: Some("mqtt://10.0.0.5:1885".into()),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(
            builder.options().broker_address(),
            ("10.0.0.5".to_string(), 1885)
        );
    }

    #[test]
    fn test_empty_client_id_generates_one() {
        let builder = ClientBuilder::from_config(&MqttConfig::default()).unwrap();
        assert!(builder.options().client_id().starts_with("sensorbridge-"));
    }

    #[test]
    fn test_credentials_applied() {
        let config = MqttConfig {
            username: Some("bridge".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(
            builder.options().credentials(),
            Some(("bridge".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_invalid_url_is_setup_error() {
        let config = MqttConfig {
            url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ClientSetup(_))
        ));
    }

    #[test]
    fn test_url_without_port_uses_default() {
        let broker = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!((broker.host.as_str(), broker.port, broker.tls), ("broker.local", 1883, false));
        assert!(parse_broker_url("amqp://broker.local").is_err());
        assert!(parse_broker_url("mqtt://broker.local:port").is_err());
        assert!(parse_broker_url("mqtt://").is_err());
    }

    #[test]
    fn test_tls_schemes_select_tls() {
        let broker = parse_broker_url("mqtts://abc123.s1.eu.hivemq.cloud").unwrap();
        assert_eq!(broker.host, "abc123.s1.eu.hivemq.cloud");
        assert_eq!(broker.port, 8883);
        assert!(broker.tls);

        let broker = parse_broker_url("ssl://broker.local:8884").unwrap();
        assert_eq!((broker.port, broker.tls), (8884, true));
        assert!(parse_broker_url("tls://broker.local").unwrap().tls);
    }

    #[test]
    fn test_ipv6_host_unbracketed() {
        let broker = parse_broker_url("mqtt://[::1]:1883").unwrap();
        assert_eq!(broker.host, "::1");

        let config = MqttConfig {
            url: Some("mqtt://[fe80::2]".into()),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.options().broker_address(), ("fe80::2".to_string(), 1883));
    }

    #[test]
    fn test_url_credentials_used_unless_configured() {
        let mut config = MqttConfig {
            url: Some("mqtt://sensor:pw@broker.local".into()),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(
            builder.options().credentials(),
            Some(("sensor".to_string(), "pw".to_string()))
        );

        config.username = Some("bridge".into());
        config.password = Some("secret".into());
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(
            builder.options().credentials(),
            Some(("bridge".to_string(), "secret".to_string()))
        );

        config.url = Some("mqtt://broker.local".into());
        config.username = None;
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.options().credentials(), None);
    }

    #[test]
    fn test_tls_section_loads_ca_file() {
        let path = std::env::temp_dir().join(format!("sensorbridge-ca-{}.pem", std::process::id()));
        fs::write(&path, b"-----BEGIN CERTIFICATE-----\n").unwrap();

        let config = MqttConfig {
            url: Some("mqtts://broker.local".into()),
            tls: Some(TlsConfig {
                ca_cert_path: Some(path.to_string_lossy().into_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config).unwrap();
        assert_eq!(builder.options().broker_address(), ("broker.local".to_string(), 8883));
        match builder.options().transport() {
            Transport::Tls(TlsConfiguration::Simple { ca, client_auth, .. }) => {
                assert_eq!(ca, b"-----BEGIN CERTIFICATE-----\n".to_vec());
                assert!(client_auth.is_none());
            }
            _ => panic!("expected a TLS transport"),
        }

        fs::remove_file(&path).unwrap();
        assert!(matches!(
            ClientBuilder::from_config(&config),
            Err(TransferError::ClientSetup(_))
        ));
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }
}
