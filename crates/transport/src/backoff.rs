//! Reconnection delay policy shared by both links.
//!
//! Neither link ever gives up: every failed or closed session schedules exactly
//! one new attempt after [`Backoff::next_sleep`]. The baseline policy is a fixed
//! delay (5 seconds); a capped exponential schedule with jitter can be enabled
//! through [`ReconnectConfig`] to spread reconnect storms when a broker recovers.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max) * (1 - U(0, jitter))
//! ```
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use sensorbridge_transport::Backoff;
//!
//! let mut backoff = Backoff::fixed(Duration::from_secs(5));
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(5));
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(5));
//! assert_eq!(backoff.attempt(), 2);
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnection settings, flattened into each link's configuration section.
///
/// ```toml
/// reconnect_delay = 5
/// reconnect_max_delay = 60
/// reconnect_multiplier = 2.0
/// reconnect_jitter = 0.2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt, in seconds.
    #[serde(rename = "reconnect_delay")]
    #[validate(range(
        min = 1,
        max = 300,
        message = "Reconnect delay must be between 1 and 300 seconds"
    ))]
    pub delay: u64,

    /// Upper bound for the delay, in seconds. Defaults to `delay`.
    #[serde(rename = "reconnect_max_delay")]
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect max delay must be between 1 and 3600 seconds"
    ))]
    pub max_delay: Option<u64>,

    /// Growth factor applied after each attempt. `1.0` keeps the delay fixed.
    #[serde(rename = "reconnect_multiplier")]
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect multiplier must be between 1.0 and 10.0"
    ))]
    pub multiplier: f64,

    /// Fraction of each delay that may be randomly shaved off (0 disables jitter).
    #[serde(rename = "reconnect_jitter")]
    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "Reconnect jitter must be between 0.0 and 1.0"
    ))]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY.as_secs(),
            max_delay: None,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

/// Reconnection delay controller.
///
/// Call [`next_sleep`](Self::next_sleep) after every failed or closed session
/// and [`reset`](Self::reset) once a session is established again.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    /// Attempts scheduled since the last reset.
    attempt: u32,
}

impl Backoff {
    /// Creates an exponential schedule starting at `initial` and capped at `max`.
    ///
    /// A `multiplier` at or below `1.0` degrades to a fixed delay, and a `max`
    /// below `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Creates a schedule that always waits `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Enables subtractive jitter; `fraction` is clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_secs(config.delay);
        let max = Duration::from_secs(config.max_delay.unwrap_or(config.delay));
        Self::new(initial, max, config.multiplier).with_jitter(config.jitter)
    }

    /// Returns to the initial delay. Call when a session is established.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay before the next attempt and advances the schedule.
    ///
    /// Never fails: the links retry forever.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let sleep = self.current_delay;

        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        if self.jitter > 0.0 {
            let shave = rand::thread_rng().gen_range(0.0..self.jitter);
            return sleep.mul_f64(1.0 - shave);
        }
        sleep
    }

    /// Attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay the next call to `next_sleep` starts from (before jitter).
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}
