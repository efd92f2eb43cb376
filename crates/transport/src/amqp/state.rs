//! Lifecycle states of the publisher link.
//!
//! ```text
//! Disconnected ──run()──> Connecting ──(channel + queue declared)──> Ready
//!       ▲                     │                                       │
//!       └──(error, delay)─────┴──────────(error | close)──────────────┘
//! ```
//!
//! Like the subscriber link, it never settles in a terminal state.

use std::fmt;

/// Current state of the queue publisher link.
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherState {
    /// No usable channel. Carries the reason (initially `"not started"`).
    Disconnected(String),

    /// Connecting, opening the channel or declaring the queue.
    Connecting,

    /// Connection, channel and queue declaration all succeeded.
    Ready,
}

impl PublisherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublisherState::Disconnected(_) => "Disconnected",
            PublisherState::Connecting => "Connecting",
            PublisherState::Ready => "Ready",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PublisherState::Ready)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, PublisherState::Disconnected(_))
    }
}

impl Default for PublisherState {
    fn default() -> Self {
        PublisherState::Disconnected("not started".into())
    }
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublisherState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}
