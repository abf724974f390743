//! MBX Bridge Framework
//!
//! Common abstractions for building bridges that publish field-bus data to
//! an MQTT broker.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`MqttSession`] for the broker connection, Last-Will and topic handlers
//! - [`MqttLink`] as the seam bridges publish and subscribe through
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] and [`BridgeHealth`] for standardized reporting
//!
//! # Example
//!
//! ```ignore
//! use mbx_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
//!
//!     // Spawn protocol-specific workers
//!     runner.spawn(my_worker(runner.session()));
//!
//!     // Run until Ctrl+C
//!     runner.run().await
//! }
//! ```

mod args;
mod config;
mod error;
mod health;
mod link;
mod memory;
mod runner;
mod session;
mod settings;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use health::{BridgeHealth, DeviceLiveness, DeviceStatus, HealthSnapshot, Indicator};
pub use link::{HandlerFuture, HandlerTable, MqttLink, TopicHandler, topic_handler};
pub use memory::{MemoryLink, PublishedMessage};
pub use runner::{BridgeRunner, shutdown_signal};
pub use session::{
    CLIENT_ID_PREFIX, MqttSession, SessionState, SystemHandlers, generate_client_id,
};
pub use settings::{
    DEFAULT_PORT, DEFAULT_RECONNECT_INTERVAL, MqttConfig, MqttSettings, SecretStore,
    UNCONFIGURED_BROKER, WillMessage, extract_host,
};
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types
pub use mbx_common::{LogFormat, LoggingConfig, TopicRoot};
pub use rumqttc::QoS;
