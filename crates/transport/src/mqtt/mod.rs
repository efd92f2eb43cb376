//! MQTT subscribe side: configuration, client construction and the
//! reconnecting [`SubscriberLink`].

pub mod client;
pub mod config;
pub mod link;
pub mod state;
pub mod transport;

pub use config::{MqttConfig, TlsConfig};
pub use link::SubscriberLink;
pub use state::SubscriberState;
pub use transport::{InboundMessage, MqttTransport, SubscribeTransport};
