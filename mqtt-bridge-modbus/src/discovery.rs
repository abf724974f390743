//! Home-Assistant discovery descriptors.
//!
//! Every read or write datapoint of a device with discovery enabled is
//! announced with one retained JSON document on
//! `homeassistant/<kind>/<device>/<datapoint>/config`.

use mbx_common::ha_config_topic;
use serde::Serialize;

use crate::model::{Datapoint, Device, FunctionCode};
use crate::topic::{TopicBuilder, datapoint_segment, device_segment, friendly_name};

pub const PAYLOAD_AVAILABLE: &str = "online";
pub const PAYLOAD_NOT_AVAILABLE: &str = "offline";

/// Home-Assistant entity kind of a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Sensor,
    Switch,
    Number,
}

impl EntityKind {
    pub fn for_function(function: FunctionCode) -> Option<Self> {
        match function {
            f if f.is_read() => Some(EntityKind::Sensor),
            FunctionCode::WriteCoil => Some(EntityKind::Switch),
            FunctionCode::WriteHolding | FunctionCode::WriteMultipleHolding => {
                Some(EntityKind::Number)
            }
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::Switch => "switch",
            EntityKind::Number => "number",
        }
    }

    pub fn is_writable(self) -> bool {
        self != EntityKind::Sensor
    }
}

/// Device block shared by all entities of a slave.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
}

/// Discovery document of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    pub name: String,
    pub unique_id: String,
    pub object_id: String,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    pub device: DiscoveryDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
}

/// A descriptor ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub kind: EntityKind,
    pub config: DiscoveryConfig,
}

impl DiscoveryMessage {
    pub fn payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.config)
    }
}

/// Descriptors of a device and whether it has any eligible datapoint.
#[derive(Debug, Clone, Default)]
pub struct DeviceDiscovery {
    pub messages: Vec<DiscoveryMessage>,
    pub eligible: bool,
}

/// Build the discovery descriptors of a device.
pub fn device_discovery(topics: &TopicBuilder, device: &Device) -> DeviceDiscovery {
    let device_seg = device_segment(device);
    let availability_topic = topics.availability_topic(device);
    let identifier = match device.id.trim() {
        "" => device_seg.clone(),
        id => id.to_string(),
    };
    let device_block = DiscoveryDevice {
        identifiers: vec![identifier],
        name: if device.name.is_empty() {
            device_seg.clone()
        } else {
            device.name.clone()
        },
    };

    let mut discovery = DeviceDiscovery::default();

    for dp in &device.datapoints {
        let Some(kind) = EntityKind::for_function(dp.function) else {
            continue;
        };
        discovery.eligible = true;

        let dp_topic = topics.datapoint_topic(device, dp);
        if dp_topic.is_empty() {
            continue;
        }

        let dp_seg = datapoint_segment(dp);
        let unique_id = if kind.is_writable() {
            format!("{}_{}_cmd", device_seg, dp_seg)
        } else {
            format!("{}_{}", device_seg, dp_seg)
        };
        let unit = (!dp.unit.is_empty()).then(|| dp.unit.clone());

        let mut config = DiscoveryConfig {
            name: friendly_name(device, dp),
            unique_id: unique_id.clone(),
            object_id: unique_id,
            availability_topic: availability_topic.clone(),
            payload_available: PAYLOAD_AVAILABLE,
            payload_not_available: PAYLOAD_NOT_AVAILABLE,
            device: device_block.clone(),
            state_topic: None,
            command_topic: None,
            unit_of_measurement: None,
            state_class: None,
            payload_on: None,
            payload_off: None,
            optimistic: None,
            min: None,
            max: None,
            step: None,
            mode: None,
        };

        match kind {
            EntityKind::Sensor => {
                config.state_topic = Some(dp_topic);
                config.unit_of_measurement = unit;
                if dp.function == FunctionCode::ReadHolding {
                    config.state_class = Some("measurement");
                }
            }
            EntityKind::Switch | EntityKind::Number => {
                match state_topic_for(topics, device, &dp_topic) {
                    Some(state) => config.state_topic = Some(state),
                    None => config.optimistic = Some(true),
                }
                config.command_topic = Some(dp_topic);
                if kind == EntityKind::Switch {
                    config.payload_on = Some("1");
                    config.payload_off = Some("0");
                } else {
                    let step = number_step(dp);
                    config.unit_of_measurement = unit;
                    config.min = Some(0);
                    config.max = Some(round6(f64::from(u16::MAX) * step));
                    config.step = Some(step);
                    config.mode = Some("box");
                }
            }
        }

        discovery.messages.push(DiscoveryMessage {
            topic: ha_config_topic(kind.as_str(), &device_seg, &dp_seg),
            kind,
            config,
        });
    }

    discovery
}

/// Topic of a read datapoint publishing where a command is received.
fn state_topic_for(topics: &TopicBuilder, device: &Device, command_topic: &str) -> Option<String> {
    device
        .datapoints
        .iter()
        .filter(|candidate| candidate.function.is_read())
        .map(|candidate| topics.datapoint_topic(device, candidate))
        .find(|topic| topic == command_topic)
}

fn number_step(dp: &Datapoint) -> f64 {
    let scale = if dp.scale == 0.0 { 1.0 } else { dp.scale };
    if scale > 0.0 {
        round6(f64::from(scale))
    } else {
        1.0
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbx_common::TopicRoot;
    use serde_json::{Value, json};

    fn point(id: &str, name: &str, function: FunctionCode) -> Datapoint {
        Datapoint {
            id: id.to_string(),
            name: name.to_string(),
            function,
            ..Datapoint::default()
        }
    }

    fn boiler() -> Device {
        let mut device = Device::new("boiler", "Boiler", 3);
        device.mqtt_enabled = true;
        device.ha_discovery_enabled = true;
        device
    }

    fn topics() -> TopicBuilder {
        TopicBuilder::new(TopicRoot::new("mbx_root"))
    }

    fn as_json(message: &DiscoveryMessage) -> Value {
        serde_json::from_str(&message.payload().unwrap()).unwrap()
    }

    #[test]
    fn test_sensor_descriptor() {
        let mut device = boiler();
        let mut voltage = point("boiler.voltage", "Voltage", FunctionCode::ReadHolding);
        voltage.unit = "V".to_string();
        device.datapoints.push(voltage);

        let discovery = device_discovery(&topics(), &device);
        assert!(discovery.eligible);
        assert_eq!(discovery.messages.len(), 1);

        let message = &discovery.messages[0];
        assert_eq!(message.topic, "homeassistant/sensor/boiler/voltage/config");
        assert_eq!(
            as_json(message),
            json!({
                "name": "Boiler Voltage",
                "unique_id": "boiler_voltage",
                "object_id": "boiler_voltage",
                "availability_topic": "mbx_root/boiler/status",
                "payload_available": "online",
                "payload_not_available": "offline",
                "device": { "identifiers": ["boiler"], "name": "Boiler" },
                "state_topic": "mbx_root/boiler/voltage",
                "unit_of_measurement": "V",
                "state_class": "measurement"
            })
        );
    }

    #[test]
    fn test_input_sensor_has_no_state_class() {
        let mut device = boiler();
        device
            .datapoints
            .push(point("boiler.flow", "Flow", FunctionCode::ReadInput));

        let discovery = device_discovery(&topics(), &device);
        let json = as_json(&discovery.messages[0]);
        assert!(json.get("state_class").is_none());
        assert!(json.get("unit_of_measurement").is_none());
    }

    #[test]
    fn test_switch_with_state_topic() {
        let mut device = boiler();
        let mut state = point("boiler.pump_state", "Pump State", FunctionCode::ReadCoil);
        state.topic = "mbx_root/boiler/pump".to_string();
        let mut command = point("boiler.pump", "Pump", FunctionCode::WriteCoil);
        command.topic = "mbx_root/boiler/pump".to_string();
        device.datapoints = vec![state, command];

        let discovery = device_discovery(&topics(), &device);
        let switch = &discovery.messages[1];
        assert_eq!(switch.kind, EntityKind::Switch);
        assert_eq!(switch.topic, "homeassistant/switch/boiler/pump/config");

        let json = as_json(switch);
        assert_eq!(json["unique_id"], "boiler_pump_cmd");
        assert_eq!(json["command_topic"], "mbx_root/boiler/pump");
        assert_eq!(json["state_topic"], "mbx_root/boiler/pump");
        assert_eq!(json["payload_on"], "1");
        assert_eq!(json["payload_off"], "0");
        assert!(json.get("optimistic").is_none());
    }

    #[test]
    fn test_number_descriptor() {
        let mut device = boiler();
        let mut setpoint = point("boiler.setpoint", "Setpoint", FunctionCode::WriteHolding);
        setpoint.scale = 0.1;
        setpoint.unit = "°C".to_string();
        device.datapoints.push(setpoint);

        let discovery = device_discovery(&topics(), &device);
        let number = &discovery.messages[0];
        assert_eq!(number.topic, "homeassistant/number/boiler/setpoint/config");

        let json = as_json(number);
        assert_eq!(json["optimistic"], true);
        assert_eq!(json["min"], 0);
        assert_eq!(json["max"].as_f64(), Some(6553.5));
        assert_eq!(json["step"].as_f64(), Some(0.1));
        assert_eq!(json["mode"], "box");
        assert_eq!(json["unit_of_measurement"], "°C");
        assert!(json.get("state_topic").is_none());
    }

    #[test]
    fn test_number_with_negative_scale() {
        let mut device = boiler();
        let mut setpoint = point("boiler.offset", "Offset", FunctionCode::WriteMultipleHolding);
        setpoint.scale = -2.0;
        device.datapoints.push(setpoint);

        let config = &device_discovery(&topics(), &device).messages[0].config;
        assert_eq!(config.step, Some(1.0));
        assert_eq!(config.max, Some(65535.0));
    }

    #[test]
    fn test_identity_fallbacks() {
        let mut device = Device::new("  ", "", 12);
        device.mqtt_enabled = true;
        device.ha_discovery_enabled = true;
        device
            .datapoints
            .push(point("x.temp", "", FunctionCode::ReadHolding));

        let config = &device_discovery(&topics(), &device).messages[0].config;
        assert_eq!(config.device.identifiers, vec!["device_12".to_string()]);
        assert_eq!(config.device.name, "device_12");
        assert_eq!(config.unique_id, "device_12_temp");
    }

    #[test]
    fn test_device_without_datapoints_is_not_eligible() {
        let discovery = device_discovery(&topics(), &boiler());
        assert!(!discovery.eligible);
        assert!(discovery.messages.is_empty());
    }
}
