//! Gateway between a Modbus-RTU serial bus and an MQTT broker.
//!
//! The gateway polls configured datapoints on the slaves of one half-duplex
//! RS-485 bus and publishes their values under a root topic. Write
//! datapoints are driven by inbound MQTT messages.
//!
//! # Topics
//!
//! ```text
//! <root>/<device>/<datapoint>                         values and write commands
//! <root>/<device>/status                              retained online/offline
//! homeassistant/<kind>/<device>/<datapoint>/config    discovery descriptors
//! <root>/system/...                                   admin surface
//! ```
//!
//! Where `<device>` and `<datapoint>` are slugs of the configured names.

pub mod admin;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod payload;
pub mod scheduler;
pub mod topic;
