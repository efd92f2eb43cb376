//! Lifecycle states of the subscriber link.
//!
//! ```text
//! Disconnected ──run()──> Connecting ──(CONNACK)──> Subscribed
//!       ▲                     │                         │
//!       └──(error, delay)─────┴──────(error | close)────┘
//! ```
//!
//! There is no terminal state: the link keeps cycling until it is cancelled.

use std::fmt;

/// Current state of the subscriber link, published over a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberState {
    /// No session. Carries the reason (initially `"not started"`).
    Disconnected(String),

    /// Waiting for the broker to accept the session.
    Connecting,

    /// Session established and the topic subscription has been requested.
    ///
    /// Inbound messages are delivered only in this state.
    Subscribed,
}

impl SubscriberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberState::Disconnected(_) => "Disconnected",
            SubscriberState::Connecting => "Connecting",
            SubscriberState::Subscribed => "Subscribed",
        }
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscriberState::Subscribed)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, SubscriberState::Disconnected(_))
    }
}

impl Default for SubscriberState {
    fn default() -> Self {
        SubscriberState::Disconnected("not started".into())
    }
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriberState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SubscriberState::Subscribed.to_string(), "Subscribed");
        assert_eq!(SubscriberState::Connecting.to_string(), "Connecting");
        assert_eq!(
            SubscriberState::Disconnected("broker closed".into()).to_string(),
            "Disconnected (broker closed)"
        );
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let state = SubscriberState::default();
        assert!(state.is_disconnected());
        assert!(!state.is_subscribed());
        assert_eq!(state.as_str(), "Disconnected");
    }
}
