//! `[relay]` section: delivery channel size, concurrency bound and shutdown drain.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RelayConfig {
    /// Capacity of the channel between the subscriber link and the dispatcher.
    #[validate(range(min = 1, max = 100_000, message = "Channel capacity must be between 1 and 100000"))]
    pub channel_capacity: usize,

    /// Maximum number of messages handled concurrently.
    #[validate(range(min = 1, max = 1024, message = "Max in-flight must be between 1 and 1024"))]
    pub max_in_flight: usize,

    /// How long shutdown waits for in-flight messages.
    #[validate(range(max = 300, message = "Drain timeout must not exceed 300 seconds"))]
    pub drain_timeout_secs: u64,
}

impl RelayConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            max_in_flight: 32,
            drain_timeout_secs: 10,
        }
    }
}
