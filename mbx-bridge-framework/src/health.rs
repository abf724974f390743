//! Bridge health monitoring.
//!
//! This module provides:
//! - [`BridgeHealth`] for tracking transaction and publish counters
//! - [`DeviceLiveness`] for tracking per-device reachability
//! - [`Indicator`] flags mirroring the gateway's status lights

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::link::MqttLink;

/// Consecutive failures after which a device is reported offline.
const OFFLINE_AFTER_FAILURES: u32 = 3;

/// Status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Broker connection is up.
    Mqtt,
    /// Modbus polling is active.
    Modbus,
}

/// Device availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device is responding normally.
    Online,
    /// Device is not responding.
    Offline,
    /// Device is responding but with errors.
    Degraded,
    /// Device status is unknown (never polled).
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Device liveness information for serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLiveness {
    /// Current status.
    pub status: DeviceStatus,
    /// Last successful transaction (millis since epoch).
    pub last_seen: i64,
    /// Consecutive failures count.
    pub consecutive_failures: u32,
    /// Last error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Bridge name.
    pub bridge: String,
    /// Overall health status.
    pub status: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Broker connection indicator.
    pub mqtt_connected: bool,
    /// Modbus polling indicator.
    pub modbus_active: bool,
    /// Successful bus transactions.
    pub transactions_ok: u64,
    /// Failed bus transactions.
    pub transactions_failed: u64,
    /// Messages accepted by the broker link.
    pub messages_published: u64,
    /// Messages the broker link refused.
    pub publish_failures: u64,
    /// Inbound write commands handled.
    pub commands_handled: u64,
    /// Inbound write commands rejected or failed.
    pub commands_failed: u64,
    /// Duration of the last tick in milliseconds.
    pub last_tick_duration_ms: u64,
    /// Per-device liveness.
    pub devices: BTreeMap<String, DeviceLiveness>,
}

/// Bridge health metrics.
#[derive(Debug)]
pub struct BridgeHealth {
    bridge_name: String,
    start_time: Instant,
    mqtt_connected: AtomicBool,
    modbus_active: AtomicBool,
    transactions_ok: AtomicU64,
    transactions_failed: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    commands_handled: AtomicU64,
    commands_failed: AtomicU64,
    last_tick_duration_ms: AtomicU64,
    devices: RwLock<BTreeMap<String, DeviceLiveness>>,
}

impl BridgeHealth {
    /// Create a new health tracker.
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            start_time: Instant::now(),
            mqtt_connected: AtomicBool::new(false),
            modbus_active: AtomicBool::new(false),
            transactions_ok: AtomicU64::new(0),
            transactions_failed: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            commands_handled: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            last_tick_duration_ms: AtomicU64::new(0),
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Set an indicator flag.
    pub fn set_indicator(&self, indicator: Indicator, on: bool) {
        match indicator {
            Indicator::Mqtt => self.mqtt_connected.store(on, Ordering::Release),
            Indicator::Modbus => self.modbus_active.store(on, Ordering::Release),
        }
    }

    /// Read an indicator flag.
    pub fn indicator(&self, indicator: Indicator) -> bool {
        match indicator {
            Indicator::Mqtt => self.mqtt_connected.load(Ordering::Acquire),
            Indicator::Modbus => self.modbus_active.load(Ordering::Acquire),
        }
    }

    /// Replace the set of tracked devices, keeping state for ids that remain.
    pub fn set_devices<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = BTreeMap::new();
        for id in ids {
            let id = id.into();
            let state = devices.remove(&id).unwrap_or_default();
            next.insert(id, state);
        }
        *devices = next;
    }

    /// Record a successful transaction with a device.
    pub fn record_device_success(&self, device_id: &str) {
        self.transactions_ok.fetch_add(1, Ordering::Relaxed);

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let state = devices.entry(device_id.to_string()).or_default();
        state.status = DeviceStatus::Online;
        state.last_seen = chrono::Utc::now().timestamp_millis();
        state.consecutive_failures = 0;
        state.last_error = None;
    }

    /// Record a failed transaction with a device.
    pub fn record_device_failure(&self, device_id: &str, error: &str) {
        self.transactions_failed.fetch_add(1, Ordering::Relaxed);

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let state = devices.entry(device_id.to_string()).or_default();
        state.consecutive_failures += 1;
        state.last_error = Some(error.to_string());
        state.status = if state.consecutive_failures >= OFFLINE_AFTER_FAILURES {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Degraded
        };
    }

    /// Record the outcome of a publish.
    pub fn record_publish(&self, accepted: bool) {
        if accepted {
            self.messages_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of an inbound command.
    pub fn record_command(&self, ok: bool) {
        if ok {
            self.commands_handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record tick duration.
    pub fn record_tick_duration(&self, duration_ms: u64) {
        self.last_tick_duration_ms
            .store(duration_ms, Ordering::Relaxed);
    }

    /// Liveness of one device.
    pub fn device_liveness(&self, device_id: &str) -> Option<DeviceLiveness> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// Get a snapshot of current health metrics.
    pub fn snapshot(&self) -> HealthSnapshot {
        let devices = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mqtt_connected = self.indicator(Indicator::Mqtt);
        let modbus_active = self.indicator(Indicator::Modbus);

        let offline = devices
            .values()
            .filter(|d| d.status == DeviceStatus::Offline)
            .count();
        let impaired = devices
            .values()
            .filter(|d| matches!(d.status, DeviceStatus::Offline | DeviceStatus::Degraded))
            .count();

        let status = if !devices.is_empty() && offline == devices.len() {
            "error"
        } else if impaired > 0 || !mqtt_connected {
            "degraded"
        } else {
            "healthy"
        };

        HealthSnapshot {
            bridge: self.bridge_name.clone(),
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            mqtt_connected,
            modbus_active,
            transactions_ok: self.transactions_ok.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            commands_handled: self.commands_handled.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            last_tick_duration_ms: self.last_tick_duration_ms.load(Ordering::Relaxed),
            devices,
        }
    }

    /// Publish a health snapshot to `<root>/system/health`.
    pub fn publish_health(&self, link: &dyn MqttLink) -> Result<()> {
        let topic = link.root_topic().system("health");
        let payload = serde_json::to_string(&self.snapshot())?;
        if link.publish_qos(&topic, &payload, QoS::AtMostOnce, false) {
            Ok(())
        } else {
            Err(BridgeError::publish(topic, "not connected"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLink;

    #[test]
    fn test_health_new() {
        let health = BridgeHealth::new("test");
        let snapshot = health.snapshot();

        assert_eq!(snapshot.bridge, "test");
        assert_eq!(snapshot.status, "degraded");
        assert!(snapshot.devices.is_empty());
    }

    #[test]
    fn test_device_failure_progression() {
        let health = BridgeHealth::new("test");
        health.set_indicator(Indicator::Mqtt, true);

        health.record_device_failure("boiler", "ResponseTimedOut(0xE2)");
        assert_eq!(
            health.device_liveness("boiler").unwrap().status,
            DeviceStatus::Degraded
        );

        health.record_device_failure("boiler", "ResponseTimedOut(0xE2)");
        health.record_device_failure("boiler", "ResponseTimedOut(0xE2)");
        let liveness = health.device_liveness("boiler").unwrap();
        assert_eq!(liveness.status, DeviceStatus::Offline);
        assert_eq!(liveness.consecutive_failures, 3);
        assert_eq!(health.snapshot().status, "error");

        health.record_device_success("boiler");
        let liveness = health.device_liveness("boiler").unwrap();
        assert_eq!(liveness.status, DeviceStatus::Online);
        assert!(liveness.last_error.is_none());
        assert_eq!(health.snapshot().status, "healthy");
        assert_eq!(health.snapshot().transactions_failed, 3);
    }

    #[test]
    fn test_set_devices_keeps_known_state() {
        let health = BridgeHealth::new("test");
        health.record_device_success("a");
        health.set_devices(["a", "b"]);

        assert_eq!(
            health.device_liveness("a").unwrap().status,
            DeviceStatus::Online
        );
        assert_eq!(
            health.device_liveness("b").unwrap().status,
            DeviceStatus::Unknown
        );

        health.set_devices(["b"]);
        assert!(health.device_liveness("a").is_none());
    }

    #[test]
    fn test_counters_and_publish() {
        let health = BridgeHealth::new("modbus");
        health.record_publish(true);
        health.record_publish(false);
        health.record_command(true);
        health.record_tick_duration(12);

        let link = MemoryLink::new("root");
        assert!(health.publish_health(&link).is_err());

        link.connect();
        health.publish_health(&link).unwrap();

        let messages = link.published_to("root/system/health");
        let snapshot: HealthSnapshot = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.commands_handled, 1);
        assert_eq!(snapshot.last_tick_duration_ms, 12);
    }
}
