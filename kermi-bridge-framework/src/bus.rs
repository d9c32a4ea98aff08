//! Message bus abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffPolicy, reconnect_with_backoff};
use crate::error::{BridgeError, Result};
use crate::shutdown::Shutdown;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(BridgeError::validation(format!(
                "QoS must be 0, 1 or 2, got {}",
                other
            ))),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    /// Payload decoded as UTF-8 (lossy).
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe transport used by the bridge.
///
/// Inbound messages are not returned from this trait; implementations hand
/// them to the engine through a channel created alongside the client.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Establish the connection. Subscriptions made earlier are restored.
    async fn connect(&self) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the transport currently believes it is connected.
    fn is_connected(&self) -> bool;

    /// Reconnection schedule for this endpoint.
    fn backoff(&self) -> BackoffPolicy;

    /// Reconnect, retrying with exponential backoff until success or shutdown.
    async fn reconnect_with_backoff(&self, shutdown: &Shutdown) -> Result<()> {
        let policy = self.backoff();
        reconnect_with_backoff(&policy, shutdown, "mqtt", || self.connect()).await
    }

    /// Publish a payload.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()>;

    /// Subscribe to a topic pattern. The subscription survives reconnects.
    async fn subscribe(&self, pattern: &str, qos: Qos) -> Result<()>;
}
