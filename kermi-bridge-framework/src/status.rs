//! Bridge status reporting.

use chrono::{DateTime, Utc};
use rumqttc::LastWill;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::bus::Qos;
use crate::publisher::Publisher;

/// Bridge status document, retained at `{base}/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name.
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// When this document was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Additional metadata.
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_state(bridge: impl Into<String>, version: impl Into<String>, status: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status: status.to_string(),
            timestamp: Some(Utc::now()),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(bridge, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Publishes the retained bridge status document on startup and shutdown.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    publisher: Publisher,
    topic: String,
    bridge_name: String,
    version: String,
}

impl StatusPublisher {
    /// Create a new status publisher for `topic`.
    pub fn new(
        publisher: Publisher,
        topic: impl Into<String>,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    /// Status topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Last will that marks the bridge offline if the connection drops.
    pub fn last_will(
        topic: &str,
        bridge_name: &str,
        version: &str,
        qos: Qos,
    ) -> Result<LastWill> {
        let mut offline = BridgeStatus::offline(bridge_name, version);
        offline.timestamp = None;
        let payload = serde_json::to_vec(&offline)?;
        Ok(LastWill::new(topic, payload, qos.into(), true))
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        self.publisher.publish_json(&self.topic, &status, true).await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        let status = BridgeStatus::offline(&self.bridge_name, &self.version);
        self.publisher.publish_json(&self.topic, &status, true).await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        let status = BridgeStatus::error(&self.bridge_name, &self.version, error);
        self.publisher.publish_json(&self.topic, &status, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("kermi2mqtt", "0.2.0");
        assert_eq!(status.bridge, "kermi2mqtt");
        assert_eq!(status.status, "running");
        assert!(status.timestamp.is_some());
    }

    #[test]
    fn test_status_with_metadata() {
        let status = BridgeStatus::running("kermi2mqtt", "0.2.0").with_metadata(serde_json::json!({
            "devices": ["xcenter_heat_pump", "xcenter_storage_dhw"],
            "poll_interval": 30
        }));

        assert_eq!(status.metadata["devices"][1], "xcenter_storage_dhw");
        assert_eq!(status.metadata["poll_interval"], 30);
    }

    #[test]
    fn test_error_status_serialization() {
        let status = BridgeStatus::error("kermi2mqtt", "0.2.0", "modbus unreachable");

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"error\":\"modbus unreachable\""));
    }

    #[test]
    fn test_last_will_is_retained_offline() {
        let will =
            StatusPublisher::last_will("kermi/x/status", "kermi2mqtt", "0.2.0", Qos::AtLeastOnce)
                .unwrap();
        assert_eq!(will.topic, "kermi/x/status");
        assert!(will.retain);

        let parsed: BridgeStatus = serde_json::from_slice(&will.message).unwrap();
        assert_eq!(parsed.status, "offline");
    }
}
