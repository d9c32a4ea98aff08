//! Payload publisher over a [`BusClient`].

use std::sync::Arc;

use serde::Serialize;

use crate::bus::{BusClient, Qos};
use crate::error::Result;

/// Publisher applying the bridge's QoS and retain policy.
///
/// State values use the configured state QoS and retain flag; availability
/// and status documents are always retained; command errors never are.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn BusClient>,
    qos: Qos,
    retain_state: bool,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("qos", &self.qos)
            .field("retain_state", &self.retain_state)
            .finish()
    }
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(bus: Arc<dyn BusClient>, qos: Qos, retain_state: bool) -> Self {
        Self {
            bus,
            qos,
            retain_state,
        }
    }

    /// The underlying bus.
    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    /// QoS used for every publish.
    pub fn qos(&self) -> Qos {
        self.qos
    }

    /// Publish a state value.
    pub async fn publish_state(&self, topic: &str, payload: &str) -> Result<()> {
        self.bus
            .publish(topic, payload.as_bytes().to_vec(), self.qos, self.retain_state)
            .await
    }

    /// Publish a retained text payload (availability, discovery removal).
    pub async fn publish_retained(&self, topic: &str, payload: &str) -> Result<()> {
        self.bus
            .publish(topic, payload.as_bytes().to_vec(), self.qos, true)
            .await
    }

    /// Publish a non-retained text payload.
    pub async fn publish_transient(&self, topic: &str, payload: &str) -> Result<()> {
        self.bus
            .publish(topic, payload.as_bytes().to_vec(), self.qos, false)
            .await
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        retain: bool,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.bus.publish(topic, payload, self.qos, retain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        sent: Mutex<Vec<(String, Vec<u8>, Qos, bool)>>,
    }

    #[async_trait]
    impl BusClient for RecordingBus {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn backoff(&self) -> BackoffPolicy {
            BackoffPolicy::default()
        }
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, qos, retain));
            Ok(())
        }
        async fn subscribe(&self, _pattern: &str, _qos: Qos) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retain_policy() {
        let bus = Arc::new(RecordingBus::default());
        let publisher = Publisher::new(bus.clone(), Qos::AtMostOnce, false);

        publisher.publish_state("a/state", "21.5").await.unwrap();
        publisher.publish_retained("a/availability", "online").await.unwrap();
        publisher
            .publish_json("a/set/error", &serde_json::json!({ "error": "x" }), false)
            .await
            .unwrap();

        let sent = bus.sent.lock().unwrap();
        assert_eq!(sent[0], ("a/state".to_string(), b"21.5".to_vec(), Qos::AtMostOnce, false));
        assert!(sent[1].3);
        assert_eq!(sent[2].1, br#"{"error":"x"}"#.to_vec());
        assert!(!sent[2].3);
    }
}
