//! Subscribe-side transport abstraction and its `rumqttc` implementation.
//!
//! The link drives a [`SubscribeTransport`] one session at a time. A session
//! starts with [`connect`](SubscribeTransport::connect) and ends when
//! [`next_message`](SubscribeTransport::next_message) returns an error; calling
//! `connect` again opens a fresh session on the same transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::{debug, trace, warn};

use super::{
    client::{qos_from_level, ClientBuilder},
    config::MqttConfig,
};
use crate::error::{root_cause, TransferError};

const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A PUBLISH received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait SubscribeTransport: Send {
    /// Opens a session and returns once the broker acknowledged it.
    async fn connect(&mut self) -> Result<(), TransferError>;

    /// Requests a subscription within the current session.
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransferError>;

    /// Waits for the next inbound message.
    ///
    /// Any error ends the session.
    async fn next_message(&mut self) -> Result<InboundMessage, TransferError>;

    /// Best-effort DISCONNECT. Never fails.
    async fn disconnect(&mut self);
}

/// [`SubscribeTransport`] over a `rumqttc` client and event loop.
///
/// `rumqttc` reconnects on the next `poll` after an error, so the same
/// instance serves every session of the link.
pub struct MqttTransport {
    client: AsyncClient,
    event_loop: EventLoop,
    qos: QoS,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, event_loop: EventLoop, qos: QoS) -> Self {
        Self {
            client,
            event_loop,
            qos,
        }
    }

    pub fn from_config(config: &MqttConfig) -> Result<Self, TransferError> {
        let qos = qos_from_level(config.qos)?;
        let (client, event_loop) = ClientBuilder::from_config(config)?.build();
        Ok(Self::new(client, event_loop, qos))
    }
}

#[async_trait]
impl SubscribeTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransferError> {
        loop {
            match self.event_loop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    debug!(code = ?ack.code, session_present = ack.session_present, "CONNACK received");
                    return Ok(());
                }
                event => trace!("Event before CONNACK: {:?}", event),
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransferError> {
        self.client
            .subscribe(topic, self.qos)
            .await
            .map_err(|e| TransferError::Subscribe {
                topic: topic.to_string(),
                reason: root_cause(&e),
            })
    }

    async fn next_message(&mut self) -> Result<InboundMessage, TransferError> {
        loop {
            match self.event_loop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        warn!(pkid = ack.pkid, "Broker rejected subscription");
                    } else {
                        debug!(pkid = ack.pkid, "Subscription acknowledged");
                    }
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(TransferError::Closed("disconnected by broker".into()));
                }
                event => trace!("MQTT event: {:?}", event),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("Error sending disconnect packet: {}", root_cause(&e));
            return;
        }

        // The request only leaves the client once the event loop flushes it.
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush).await.is_err() {
            debug!("Timed out flushing DISCONNECT");
        }
    }
}
