//! Settings of the gateway daemon.
//!
//! The daemon settings are a JSON5 file loaded through
//! [`BridgeConfig::load`]. They point at the Modbus configuration document
//! and at the broker settings, which both stay in the formats the admin
//! tooling writes.

use std::path::PathBuf;
use std::time::Duration;

use mbx_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig, MqttConfig, Result};
use serde::{Deserialize, Serialize};

use crate::bus::{BusTiming, DirectionMode};

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Modbus side settings.
    #[serde(default)]
    pub modbus: ModbusSection,

    /// Broker settings location.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Health reporting.
    #[serde(default)]
    pub health: HealthConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSection {
    /// Modbus configuration document.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Serial port settings.
    #[serde(default)]
    pub serial: SerialConfig,

    /// Period of the poll tick in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/mbx/config.json")
}

fn default_tick_interval_ms() -> u64 {
    100
}

impl Default for ModbusSection {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            serial: SerialConfig::default(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl ModbusSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Serial port of the RS-485 adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/ttyUSB0").
    #[serde(default = "default_port")]
    pub port: String,

    /// How the transceiver direction is switched.
    #[serde(default)]
    pub direction: DirectionMode,

    /// Settle time around direction flips in microseconds.
    #[serde(default = "default_guard_us")]
    pub guard_us: u64,

    /// Response timeout in milliseconds.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Window for dropping line noise after the direction release, in
    /// microseconds.
    #[serde(default = "default_first_byte_window_us")]
    pub first_byte_window_us: u64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_guard_us() -> u64 {
    50
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_first_byte_window_us() -> u64 {
    2500
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            direction: DirectionMode::default(),
            guard_us: default_guard_us(),
            response_timeout_ms: default_response_timeout_ms(),
            first_byte_window_us: default_first_byte_window_us(),
        }
    }
}

impl SerialConfig {
    pub fn timing(&self) -> BusTiming {
        BusTiming {
            guard: Duration::from_micros(self.guard_us),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            first_byte_window: Duration::from_micros(self.first_byte_window_us),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between health snapshots.
    #[serde(default = "default_publish_interval_secs")]
    pub publish_interval_secs: u64,
}

fn default_publish_interval_secs() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: default_publish_interval_secs(),
        }
    }
}

impl HealthConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }
}

impl GatewayConfig {
    /// Parse settings from JSON5 text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = json5::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

impl BridgeConfig for GatewayConfig {
    fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<()> {
        if self.modbus.serial.port.trim().is_empty() {
            return Err(BridgeError::validation("modbus.serial.port is required"));
        }
        if self.modbus.config_path.as_os_str().is_empty() {
            return Err(BridgeError::validation("modbus.config_path is required"));
        }
        if self.modbus.tick_interval_ms == 0 {
            return Err(BridgeError::validation(
                "modbus.tick_interval_ms must be positive",
            ));
        }
        if self.modbus.serial.response_timeout_ms == 0 {
            return Err(BridgeError::validation(
                "modbus.serial.response_timeout_ms must be positive",
            ));
        }
        if self.health.publish_interval_secs == 0 {
            return Err(BridgeError::validation(
                "health.publish_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbx_bridge_framework::LogFormat;
    use std::path::Path;

    #[test]
    fn test_parse_full_config() {
        let json5 = r#"
        {
            modbus: {
                config_path: "/var/lib/mbx/config.json",
                serial: {
                    port: "/dev/ttyAMA0",
                    direction: "none",
                    guard_us: 100,
                    response_timeout_ms: 500,
                },
                tick_interval_ms: 50,
            },
            mqtt: { settings_path: "/var/lib/mbx/mqtt.json" },
            health: { publish_interval_secs: 10 },
            logging: { level: "debug", format: "json" },
        }
        "#;

        let config = GatewayConfig::parse(json5).unwrap();
        assert_eq!(config.modbus.config_path, Path::new("/var/lib/mbx/config.json"));
        assert_eq!(config.modbus.serial.port, "/dev/ttyAMA0");
        assert_eq!(config.modbus.serial.direction, DirectionMode::Passive);
        assert_eq!(config.modbus.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.mqtt.settings_path, Path::new("/var/lib/mbx/mqtt.json"));
        assert_eq!(config.health.publish_interval(), Duration::from_secs(10));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        let timing = config.modbus.serial.timing();
        assert_eq!(timing.guard, Duration::from_micros(100));
        assert_eq!(timing.response_timeout, Duration::from_millis(500));
        assert_eq!(timing.first_byte_window, Duration::from_micros(2500));
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::parse("{}").unwrap();
        assert_eq!(config.modbus.config_path, Path::new("/etc/mbx/config.json"));
        assert_eq!(config.modbus.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.modbus.serial.direction, DirectionMode::Rts);
        assert_eq!(config.modbus.serial.timing(), BusTiming::default());
        assert_eq!(config.modbus.tick_interval_ms, 100);
        assert_eq!(config.health.publish_interval_secs, 30);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            GatewayConfig::parse(r#"{ modbus: { serial: { port: " " } } }"#),
            Err(BridgeError::ConfigValidation(_))
        ));
        assert!(matches!(
            GatewayConfig::parse("{ modbus: { tick_interval_ms: 0 } }"),
            Err(BridgeError::ConfigValidation(_))
        ));
        assert!(matches!(
            GatewayConfig::parse("{ modbus: "),
            Err(BridgeError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqtt-bridge-modbus.json5");
        std::fs::write(&path, "{ modbus: { serial: { direction: 'rts' } } }").unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.modbus.serial.direction, DirectionMode::Rts);
    }
}
