//! Configuration of the AMQP queue publisher link.
//!
//! ```toml
//! [amqp]
//! url = "amqp://rabbitmq:5672/%2f"
//! username = "bridge"
//! password = "secret"
//! queue = "sensor_readings"
//! reconnect_delay = 5
//! ```
//!
//! `username`/`password`, when set, replace any credentials embedded in `url`.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::backoff::ReconnectConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AmqpConfig {
    #[validate(length(min = 1, max = 2048, message = "AMQP url must not be empty"))]
    pub url: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Durable queue every reading is published to.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Queue name must be between 1 and 255 characters"
    ))]
    pub queue: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub reconnect: ReconnectConfig,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            username: None,
            password: None,
            queue: "sensor_readings".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}
