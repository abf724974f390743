//! Bridge status reporting.

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::link::MqttLink;

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "modbus").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Additional metadata (protocol-specific).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_status(bridge: String, version: String, status: &str) -> Self {
        Self {
            bridge,
            version,
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge.into(), version.into(), "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_status(bridge.into(), version.into(), "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_status(bridge.into(), version.into(), "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this status, retained, to `<root>/system/status`.
    pub fn publish(&self, link: &dyn MqttLink) -> Result<()> {
        let topic = link.root_topic().system("status");
        let payload = serde_json::to_string(self)?;
        if link.publish_qos(&topic, &payload, QoS::AtLeastOnce, true) {
            Ok(())
        } else {
            Err(BridgeError::publish(topic, "not connected"))
        }
    }
}

/// Helper to publish bridge status on connect and shutdown.
pub struct StatusPublisher {
    bridge_name: String,
    version: String,
}

impl StatusPublisher {
    /// Create a new status publisher.
    pub fn new(bridge_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            version: version.into(),
        }
    }

    /// Publish "running" status with optional metadata.
    pub fn publish_running(
        &self,
        link: &dyn MqttLink,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version);
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        status.publish(link)
    }

    /// Publish "offline" status.
    pub fn publish_offline(&self, link: &dyn MqttLink) -> Result<()> {
        BridgeStatus::offline(&self.bridge_name, &self.version).publish(link)
    }

    /// Publish "error" status.
    pub fn publish_error(&self, link: &dyn MqttLink, error: impl Into<String>) -> Result<()> {
        BridgeStatus::error(&self.bridge_name, &self.version, error).publish(link)
    }
}
