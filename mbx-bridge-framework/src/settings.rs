//! MQTT connection settings.
//!
//! Broker settings live in a small JSON document shared with the gateway's
//! admin tooling. The broker password is never stored there; it is resolved
//! through a [`SecretStore`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mbx_common::{DEFAULT_ROOT_TOPIC, TopicRoot};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Broker address meaning "not configured".
pub const UNCONFIGURED_BROKER: &str = "0.0.0.0";

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// The `mqtt` block of a bridge configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Path of the broker settings document.
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// File holding the broker password.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("/etc/mbx/mqtt.json")
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            settings_path: default_settings_path(),
            password_file: None,
        }
    }
}

impl MqttConfig {
    /// Build the secret store described by this block.
    pub fn secret_store(&self) -> SecretStore {
        SecretStore::new(self.password_file.clone())
    }
}

/// Source of broker credentials.
///
/// The password is read from the `MBX_MQTT_PASSWORD` environment variable
/// when set, otherwise from the configured password file. A missing secret
/// yields an empty password.
#[derive(Debug, Clone)]
pub struct SecretStore {
    env_var: String,
    password_file: Option<PathBuf>,
}

impl SecretStore {
    /// Environment variable consulted for the broker password.
    pub const PASSWORD_ENV: &'static str = "MBX_MQTT_PASSWORD";

    /// Create a store reading the default environment variable and an
    /// optional password file.
    pub fn new(password_file: Option<PathBuf>) -> Self {
        Self {
            env_var: Self::PASSWORD_ENV.to_string(),
            password_file,
        }
    }

    /// Use a different environment variable.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    /// Resolve the MQTT broker password.
    pub fn mqtt_password(&self) -> Result<String> {
        if let Ok(password) = std::env::var(&self.env_var) {
            return Ok(password);
        }

        match &self.password_file {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    BridgeError::with_context(
                        format!("Failed to read password file '{}'", path.display()),
                        e,
                    )
                })?;
                Ok(content.trim_end_matches(['\r', '\n']).to_string())
            }
            None => Ok(String::new()),
        }
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new(None)
    }
}

/// On-disk shape of the broker settings document.
#[derive(Debug, Default, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    broker_ip: String,
    #[serde(default)]
    broker_url: String,
    #[serde(default)]
    broker_port: Option<serde_json::Value>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    root_topic: Option<String>,
    #[serde(default)]
    keep_alive_secs: Option<u64>,
    #[serde(default)]
    reconnect_interval_ms: Option<u64>,
}

/// Resolved broker settings.
#[derive(Clone, PartialEq, Eq)]
pub struct MqttSettings {
    /// Broker host name or address.
    pub broker: String,
    /// Broker port.
    pub port: u16,
    /// User name; empty connects anonymously.
    pub username: String,
    /// Password from the secret store.
    pub password: String,
    /// Root topic for everything the gateway publishes.
    pub root_topic: String,
    /// MQTT keep-alive.
    pub keep_alive: Duration,
    /// Minimum delay between connection attempts.
    pub reconnect_interval: Duration,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: UNCONFIGURED_BROKER.to_string(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            root_topic: DEFAULT_ROOT_TOPIC.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("root_topic", &self.root_topic)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}

impl MqttSettings {
    /// Load settings from a document on disk.
    ///
    /// A missing document yields the defaults, which leave the broker
    /// unconfigured.
    pub fn load(path: impl AsRef<Path>, secrets: &SecretStore) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_json(&content)?
        } else {
            tracing::debug!(path = %path.display(), "MQTT settings not found, using defaults");
            Self::default()
        };

        settings.password = secrets.mqtt_password()?;

        tracing::debug!(
            broker = %settings.broker,
            port = settings.port,
            user = %settings.username,
            root_topic = %settings.root_topic,
            "Loaded MQTT settings"
        );

        Ok(settings)
    }

    /// Parse a settings document. The password is left empty.
    pub fn from_json(content: &str) -> Result<Self> {
        let doc: SettingsDocument = serde_json::from_str(content)?;
        let defaults = Self::default();

        let ip = doc.broker_ip.trim();
        let broker = if !ip.is_empty() && ip != UNCONFIGURED_BROKER {
            ip.to_string()
        } else if !doc.broker_url.trim().is_empty() {
            extract_host(doc.broker_url.trim()).to_string()
        } else {
            defaults.broker
        };

        let port = match doc.broker_port {
            None | Some(serde_json::Value::Null) => DEFAULT_PORT,
            Some(value) => parse_port(&value)?,
        };

        let root_topic = doc
            .root_topic
            .map(|t| t.trim().to_string())
            .unwrap_or(defaults.root_topic);

        Ok(Self {
            broker,
            port,
            username: doc.user.trim().to_string(),
            password: String::new(),
            root_topic,
            keep_alive: doc
                .keep_alive_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
            reconnect_interval: doc
                .reconnect_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_interval),
        })
    }

    /// Whether a broker address has been configured.
    pub fn is_configured(&self) -> bool {
        let broker = self.broker.trim();
        !broker.is_empty() && broker != UNCONFIGURED_BROKER
    }

    /// Topic builder for the configured root topic.
    pub fn topic_root(&self) -> TopicRoot {
        TopicRoot::new(&self.root_topic)
    }
}

fn parse_port(value: &serde_json::Value) -> Result<u16> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        serde_json::Value::String(s) if s.trim().is_empty() => Some(DEFAULT_PORT),
        serde_json::Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };

    match parsed {
        Some(0) | None => Err(BridgeError::validation(format!(
            "invalid broker_port: {}",
            value
        ))),
        Some(port) => Ok(port),
    }
}

/// Extract the host part of a broker URL.
///
/// The scheme, port and path are stripped.
///
/// # Example
/// ```
/// use mbx_bridge_framework::extract_host;
///
/// assert_eq!(extract_host("mqtt://broker.local:1883/path"), "broker.local");
/// assert_eq!(extract_host("10.0.0.5"), "10.0.0.5");
/// ```
pub fn extract_host(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let end = rest.find(['/', ':']).unwrap_or(rest.len());
    &rest[..end]
}

/// Last-Will message registered with the broker on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl WillMessage {
    /// Build a will, returning `None` if the topic or payload is blank.
    pub fn new(
        topic: impl AsRef<str>,
        payload: impl AsRef<str>,
        qos: QoS,
        retain: bool,
    ) -> Option<Self> {
        let topic = topic.as_ref().trim();
        let payload = payload.as_ref().trim();
        if topic.is_empty() || payload.is_empty() {
            return None;
        }
        Some(Self {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_unconfigured() {
        let settings = MqttSettings::default();
        assert!(!settings.is_configured());
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.root_topic, "mbx_root");
        assert_eq!(settings.reconnect_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_broker_ip_wins_over_url() {
        let settings = MqttSettings::from_json(
            r#"{"broker_ip": "10.0.0.2", "broker_url": "mqtt://other:1884", "broker_port": "1884"}"#,
        )
        .unwrap();
        assert_eq!(settings.broker, "10.0.0.2");
        assert_eq!(settings.port, 1884);
    }

    #[test]
    fn test_url_used_when_ip_unconfigured() {
        let settings = MqttSettings::from_json(
            r#"{"broker_ip": "0.0.0.0", "broker_url": "tcp://broker.lan:1883/x", "broker_port": 8883, "user": " alice ", "root_topic": " plant "}"#,
        )
        .unwrap();
        assert_eq!(settings.broker, "broker.lan");
        assert_eq!(settings.port, 8883);
        assert_eq!(settings.username, "alice");
        assert_eq!(settings.root_topic, "plant");
        assert!(settings.is_configured());
    }

    #[test]
    fn test_invalid_port_rejected() {
        let result = MqttSettings::from_json(r#"{"broker_port": "http"}"#);
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let secrets = SecretStore::default().with_env_var("MBX_TEST_UNSET_PASSWORD_VAR");
        let settings = MqttSettings::load("/nonexistent/mqtt.json", &secrets).unwrap();
        assert_eq!(settings, MqttSettings::default());
    }

    #[test]
    fn test_password_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let pass = dir.path().join("pass");
        std::fs::write(&pass, "s3cret\n").unwrap();
        let doc = dir.path().join("mqtt.json");
        std::fs::write(&doc, r#"{"broker_ip": "127.0.0.1", "user": "gw"}"#).unwrap();

        let secrets = SecretStore::new(Some(pass)).with_env_var("MBX_TEST_UNSET_PASSWORD_VAR");
        let settings = MqttSettings::load(&doc, &secrets).unwrap();

        assert_eq!(settings.password, "s3cret");
        assert!(!format!("{:?}", settings).contains("s3cret"));
    }

    #[test]
    fn test_will_requires_topic_and_payload() {
        assert!(WillMessage::new("a/status", "offline", QoS::AtLeastOnce, true).is_some());
        assert!(WillMessage::new(" ", "offline", QoS::AtLeastOnce, true).is_none());
        assert!(WillMessage::new("a/status", "", QoS::AtLeastOnce, true).is_none());
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("broker:1883"), "broker");
        assert_eq!(extract_host("mqtts://h/p"), "h");
    }
}
