//! AMQP publish side: configuration, the `lapin` session and the reconnecting
//! [`QueuePublisherLink`].

pub mod config;
pub mod link;
pub mod state;
pub mod transport;

pub use config::AmqpConfig;
pub use link::{QueueHandle, QueuePublisherLink};
pub use state::PublisherState;
pub use transport::{LapinConnector, QueueConnector, QueueSession};
