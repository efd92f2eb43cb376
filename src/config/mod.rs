//! Application configuration.
//!
//! Loaded once at startup from a TOML file, then overridden by the deployment's
//! environment variables (a `.env` file is honoured) and validated. The
//! configuration is immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use sensorbridge_transport::{amqp::AmqpConfig, mqtt::MqttConfig};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use validator::Validate;

use self::{anomaly::AnomalyConfig, database::DatabaseConfig, logger::LoggerConfig, relay::RelayConfig};

pub mod anomaly;
pub mod database;
pub mod logger;
pub mod relay;

const CONFIG_ENV: &str = "SENSORBRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/sensorbridge/config.toml";

/// Timestamp for messages printed before the tracing subscriber exists.
pub fn console_timestamp() -> String {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "-".to_string())
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Inbound sensor feed.
    #[validate(nested)]
    pub mqtt: MqttConfig,

    /// Durable outbound queue.
    #[validate(nested)]
    pub amqp: AmqpConfig,

    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(nested)]
    pub relay: RelayConfig,

    #[validate(nested)]
    pub anomaly: AnomalyConfig,
}

impl Config {
    /// Locates, loads, overrides from the environment and validates.
    ///
    /// Without a config file the built-in defaults are used, so an env-only
    /// deployment keeps working.
    pub fn new() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            print_info!("Loaded environment from {}", path.display());
        }

        let mut config = match Self::get_config_path() {
            Some(path) => Self::read(&path)?,
            None => {
                print_warn!(
                    "No configuration file found ({} unset, {} missing), using defaults",
                    CONFIG_ENV,
                    DEFAULT_CONFIG_PATH
                );
                Config::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.check()?;
        Ok(config)
    }

    /// Priority: `SENSORBRIDGE_CONFIG`, then `/etc/sensorbridge/config.toml`.
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Some(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Some(fallback.to_path_buf());
        }

        None
    }

    /// Loads and validates the file at `path`, without environment overrides.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let config = Self::read(path)?;
        config.check()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.to_string_lossy()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Config, ConfigError> {
        toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Applies the deployment's environment variables on top of file values.
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("MQTT_URL") {
            self.mqtt.url = Some(url);
        }
        if let Some(username) = get("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = get("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = get("MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }

        if let Some(url) = get("RABBITMQ_URL") {
            self.amqp.url = url;
        }
        if let Some(username) = get("RABBITMQ_USERNAME") {
            self.amqp.username = Some(username);
        }
        if let Some(password) = get("RABBITMQ_PASSWORD") {
            self.amqp.password = Some(password);
        }
        if let Some(queue) = get("RABBITMQ_QUEUE") {
            self.amqp.queue = queue;
        }

        if let Some(host) = get("DB_HOST") {
            self.database.host = host;
        }
        if let Some(user) = get("DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = get("DB_PASSWORD") {
            self.database.password = Some(password);
        }
        if let Some(database) = get("DB_DATABASE") {
            self.database.database = database;
        }
    }
}
