//! Modbus configuration model and its document loader.
//!
//! The configuration document is strict JSON shared with the admin tooling:
//!
//! ```json
//! {
//!   "bus": { "baud": 9600, "serialFormat": "8N1", "enabled": true },
//!   "devices": [
//!     {
//!       "id": "boiler", "name": "Boiler", "slaveId": 3,
//!       "mqttEnabled": true, "homeassistantDiscoveryEnabled": true,
//!       "dataPoints": [
//!         { "id": "boiler.voltage", "name": "Voltage", "function": 3,
//!           "address": 100, "scale": 0.1, "unit": "V", "poll_interval_ms": 1000 }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Unknown keys are ignored and missing optional keys take their defaults.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use mbx_common::slug_token;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Default baud rate of the bus.
pub const DEFAULT_BAUD: u32 = 9600;

/// Highest unicast slave id.
pub const MAX_SLAVE_ID: u8 = 247;

/// Register count limit of one read transaction.
pub const MAX_REGISTERS: u16 = 125;

/// Modbus function of a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoil,
    ReadDiscrete,
    ReadHolding,
    ReadInput,
    WriteCoil,
    WriteHolding,
    WriteMultipleHolding,
}

impl FunctionCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FunctionCode::ReadCoil),
            2 => Some(FunctionCode::ReadDiscrete),
            3 => Some(FunctionCode::ReadHolding),
            4 => Some(FunctionCode::ReadInput),
            5 => Some(FunctionCode::WriteCoil),
            6 => Some(FunctionCode::WriteHolding),
            16 => Some(FunctionCode::WriteMultipleHolding),
            _ => None,
        }
    }

    /// Function byte on the wire.
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoil => 1,
            FunctionCode::ReadDiscrete => 2,
            FunctionCode::ReadHolding => 3,
            FunctionCode::ReadInput => 4,
            FunctionCode::WriteCoil => 5,
            FunctionCode::WriteHolding => 6,
            FunctionCode::WriteMultipleHolding => 16,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoil
                | FunctionCode::ReadDiscrete
                | FunctionCode::ReadHolding
                | FunctionCode::ReadInput
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// Whether the function reads coils or discrete inputs.
    pub fn reads_bits(self) -> bool {
        matches!(self, FunctionCode::ReadCoil | FunctionCode::ReadDiscrete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionCode::ReadCoil => "FC01-READ_COIL",
            FunctionCode::ReadDiscrete => "FC02-READ_DISCRETE",
            FunctionCode::ReadHolding => "FC03-READ_HOLDING",
            FunctionCode::ReadInput => "FC04-READ_INPUT",
            FunctionCode::WriteCoil => "FC05-WRITE_COIL",
            FunctionCode::WriteHolding => "FC06-WRITE_HOLDING",
            FunctionCode::WriteMultipleHolding => "FC16-WRITE_MULTIPLE_HOLDING",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpretation of the response words of a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataType {
    Text,
    Int16,
    Int32,
    Int64,
    #[default]
    UInt16,
    UInt32,
    UInt64,
    Float32,
}

impl DataType {
    /// Parse the `dataType` field: an index `1..=8` or a lower-case name.
    ///
    /// Unknown values fall back to [`DataType::UInt16`].
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(1) => DataType::Text,
                Some(2) => DataType::Int16,
                Some(3) => DataType::Int32,
                Some(4) => DataType::Int64,
                Some(5) => DataType::UInt16,
                Some(6) => DataType::UInt32,
                Some(7) => DataType::UInt64,
                Some(8) => DataType::Float32,
                _ => DataType::UInt16,
            },
            Value::String(s) => Self::from_name(s),
            _ => DataType::UInt16,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" => DataType::Text,
            "int16" => DataType::Int16,
            "int32" => DataType::Int32,
            "int64" => DataType::Int64,
            "uint32" => DataType::UInt32,
            "uint64" => DataType::UInt64,
            "float32" => DataType::Float32,
            _ => DataType::UInt16,
        }
    }

    /// Words needed to assemble a full value.
    pub fn words(self) -> usize {
        match self {
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::UInt64 => 4,
            _ => 1,
        }
    }
}

/// Part of a register word a datapoint reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegisterSlice {
    #[default]
    Full,
    LowByte,
    HighByte,
}

impl RegisterSlice {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_u64() {
                Some(1) => RegisterSlice::LowByte,
                Some(2) => RegisterSlice::HighByte,
                _ => RegisterSlice::Full,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "low" | "low_byte" | "lowbyte" | "1" => RegisterSlice::LowByte,
                "high" | "high_byte" | "highbyte" | "2" => RegisterSlice::HighByte,
                _ => RegisterSlice::Full,
            },
            _ => RegisterSlice::Full,
        }
    }

    pub fn apply(self, word: u16) -> u16 {
        match self {
            RegisterSlice::Full => word,
            RegisterSlice::LowByte => word & 0x00FF,
            RegisterSlice::HighByte => (word >> 8) & 0x00FF,
        }
    }
}

/// Parity of the serial framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Character framing of the bus: 8 data bits, parity and stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFormat {
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialFormat {
    /// Parse one of `8N1`, `8N2`, `8E1`, `8E2`, `8O1`, `8O2`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().to_ascii_uppercase();
        let bytes = text.as_bytes();
        if bytes.len() != 3 || bytes[0] != b'8' {
            return None;
        }
        let parity = match bytes[1] {
            b'N' => Parity::None,
            b'E' => Parity::Even,
            b'O' => Parity::Odd,
            _ => return None,
        };
        let stop_bits = match bytes[2] {
            b'1' => 1,
            b'2' => 2,
            _ => return None,
        };
        Some(Self { parity, stop_bits })
    }

    /// Bits on the line per character, start bit included.
    pub fn bits_per_char(&self) -> u32 {
        let parity = if self.parity == Parity::None { 0 } else { 1 };
        1 + 8 + parity + u32::from(self.stop_bits)
    }
}

impl Default for SerialFormat {
    fn default() -> Self {
        Self {
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl fmt::Display for SerialFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "8{}{}", parity, self.stop_bits)
    }
}

/// Serial line parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub baud: u32,
    pub serial_format: SerialFormat,
    pub enabled: bool,
}

impl BusConfig {
    /// Whether two configurations need the same port setup.
    pub fn same_line(&self, other: &BusConfig) -> bool {
        self.baud == other.baud && self.serial_format == other.serial_format
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            serial_format: SerialFormat::default(),
            enabled: false,
        }
    }
}

/// A single quantity on a slave, mapped to one MQTT topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub id: String,
    pub name: String,
    pub function: FunctionCode,
    pub address: u16,
    pub num_of_registers: u16,
    pub scale: f32,
    pub data_type: DataType,
    pub unit: String,
    /// Topic override; empty when the topic is derived.
    pub topic: String,
    pub register_slice: RegisterSlice,
    pub poll_interval_ms: u32,
    /// Next due time; 0 means due on the next tick.
    pub next_due_at_ms: u32,
}

impl Default for Datapoint {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            function: FunctionCode::ReadHolding,
            address: 0,
            num_of_registers: 1,
            scale: 1.0,
            data_type: DataType::UInt16,
            unit: String::new(),
            topic: String::new(),
            register_slice: RegisterSlice::Full,
            poll_interval_ms: 0,
            next_due_at_ms: 0,
        }
    }
}

/// A slave on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub slave_id: u8,
    pub mqtt_enabled: bool,
    pub ha_discovery_enabled: bool,
    pub ha_availability_online_published: bool,
    pub ha_discovery_published: bool,
    pub datapoints: Vec<Datapoint>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, slave_id: u8) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            slave_id,
            mqtt_enabled: false,
            ha_discovery_enabled: false,
            ha_availability_online_published: false,
            ha_discovery_published: false,
            datapoints: Vec::new(),
        }
    }

    /// Forget that availability and discovery were published.
    pub fn reset_ha_flags(&mut self) {
        self.ha_availability_online_published = false;
        self.ha_discovery_published = false;
    }

    /// Whether this device takes part in Home-Assistant discovery.
    pub fn announces(&self) -> bool {
        self.mqtt_enabled && self.ha_discovery_enabled
    }
}

/// The complete Modbus configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub bus: BusConfig,
    pub devices: Vec<Device>,
}

impl Configuration {
    /// Load a configuration document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let doc: Value = mbx_common::load_json(path).map_err(|e| match e {
            mbx_common::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                ConfigError::Missing {
                    path: path.display().to_string(),
                }
            }
            other => ConfigError::Parse(format!("{}: {}", path.display(), other)),
        })?;

        let config = Self::from_value(&doc)?;
        info!(
            path = %path.display(),
            devices = config.devices.len(),
            baud = config.bus.baud,
            format = %config.bus.serial_format,
            enabled = config.bus.enabled,
            "Loaded Modbus configuration"
        );
        Ok(config)
    }

    /// Parse a configuration document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let doc: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(&doc)
    }

    /// Build a configuration from a parsed document.
    pub fn from_value(doc: &Value) -> Result<Self, ConfigError> {
        let root = doc
            .as_object()
            .ok_or_else(|| ConfigError::invalid("configuration root must be an object"))?;

        let bus = match root.get("bus").and_then(Value::as_object) {
            Some(bus) => parse_bus(bus)?,
            None => {
                warn!("Configuration has no 'bus' object; using defaults");
                BusConfig::default()
            }
        };

        let mut devices = Vec::new();
        if let Some(list) = root.get("devices") {
            let list = list
                .as_array()
                .ok_or_else(|| ConfigError::invalid("'devices' must be an array"))?;
            for (index, entry) in list.iter().enumerate() {
                let obj = entry.as_object().ok_or_else(|| {
                    ConfigError::invalid(format!("device #{} must be an object", index))
                })?;
                devices.push(parse_device(obj)?);
            }
        }

        let config = Self { bus, devices };
        config.validate()?;
        Ok(config)
    }

    /// Check id uniqueness and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.baud == 0 {
            return Err(ConfigError::invalid("bus baud must be positive"));
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if device.slave_id == 0 || device.slave_id > MAX_SLAVE_ID {
                return Err(ConfigError::invalid(format!(
                    "device '{}': slaveId must be 1-{}",
                    device.id, MAX_SLAVE_ID
                )));
            }
            if !device_ids.insert(device.id.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate device id '{}'",
                    device.id
                )));
            }

            let mut datapoint_ids = HashSet::new();
            for dp in &device.datapoints {
                if dp.num_of_registers == 0 || dp.num_of_registers > MAX_REGISTERS {
                    return Err(ConfigError::invalid(format!(
                        "datapoint '{}' of device '{}': numOfRegisters must be 1-{}",
                        dp.id, device.id, MAX_REGISTERS
                    )));
                }
                if !datapoint_ids.insert(dp.id.as_str()) {
                    return Err(ConfigError::invalid(format!(
                        "duplicate datapoint id '{}' in device '{}'",
                        dp.id, device.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Clear the availability and discovery flags of every device.
    pub fn reset_ha_flags(&mut self) {
        for device in &mut self.devices {
            device.reset_ha_flags();
        }
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

fn parse_bus(obj: &Map<String, Value>) -> Result<BusConfig, ConfigError> {
    let baud = match uint_field(obj, "baud")? {
        Some(baud) => u32::try_from(baud)
            .map_err(|_| ConfigError::invalid(format!("bus baud {} out of range", baud)))?,
        None => DEFAULT_BAUD,
    };

    let serial_format = match str_field(obj, "serialFormat") {
        Some(text) => SerialFormat::parse(text).ok_or_else(|| {
            ConfigError::invalid(format!("unsupported serial format '{}'", text))
        })?,
        None => SerialFormat::default(),
    };

    Ok(BusConfig {
        baud,
        serial_format,
        enabled: flag_field(obj, "enabled"),
    })
}

fn parse_device(obj: &Map<String, Value>) -> Result<Device, ConfigError> {
    let name = str_field(obj, "name").unwrap_or("device").trim().to_string();

    let slave_id = uint_field(obj, "slaveId")?.unwrap_or(1);
    let slave_id = u8::try_from(slave_id)
        .ok()
        .filter(|id| (1..=MAX_SLAVE_ID).contains(id))
        .ok_or_else(|| {
            ConfigError::invalid(format!(
                "device '{}': slaveId {} must be 1-{}",
                name, slave_id, MAX_SLAVE_ID
            ))
        })?;

    let id = match str_field(obj, "id").map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => slug_token(&name).unwrap_or_else(|| format!("device_{}", slave_id)),
    };

    let mut device = Device::new(id, name, slave_id);
    device.mqtt_enabled = flag_field(obj, "mqttEnabled");
    device.ha_discovery_enabled = flag_field(obj, "homeassistantDiscoveryEnabled");

    if let Some(list) = obj.get("dataPoints") {
        let list = list.as_array().ok_or_else(|| {
            ConfigError::invalid(format!("device '{}': 'dataPoints' must be an array", device.id))
        })?;
        for entry in list {
            let dp = entry.as_object().ok_or_else(|| {
                ConfigError::invalid(format!(
                    "device '{}': datapoint entries must be objects",
                    device.id
                ))
            })?;
            let dp = parse_datapoint(&device.id, dp)?;
            device.datapoints.push(dp);
        }
    }

    Ok(device)
}

fn parse_datapoint(device_id: &str, obj: &Map<String, Value>) -> Result<Datapoint, ConfigError> {
    let name = str_field(obj, "name").unwrap_or("").trim().to_string();
    let id = match str_field(obj, "id").map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => slug_token(&name).ok_or_else(|| {
            ConfigError::invalid(format!(
                "device '{}': datapoint needs an id or a name",
                device_id
            ))
        })?,
    };

    let code = uint_field(obj, "function")?.unwrap_or(3);
    let function = u8::try_from(code)
        .ok()
        .and_then(FunctionCode::from_code)
        .ok_or_else(|| {
            ConfigError::invalid(format!(
                "datapoint '{}' of device '{}': unsupported function {}",
                id, device_id, code
            ))
        })?;

    let address = uint_field(obj, "address")?.unwrap_or(0);
    let address = u16::try_from(address).map_err(|_| {
        ConfigError::invalid(format!(
            "datapoint '{}' of device '{}': address {} out of range",
            id, device_id, address
        ))
    })?;

    let count = uint_field(obj, "numOfRegisters")?.unwrap_or(1);
    let num_of_registers = u16::try_from(count).unwrap_or(u16::MAX);

    let poll_interval_ms = match uint_field(obj, "poll_interval_ms")? {
        Some(ms) => ms,
        None => obj
            .get("poll_interval")
            .and_then(Value::as_f64)
            .map(|secs| (secs.max(0.0) * 1000.0).round() as u64)
            .unwrap_or(0),
    };

    Ok(Datapoint {
        id,
        name,
        function,
        address,
        num_of_registers,
        scale: obj.get("scale").and_then(Value::as_f64).unwrap_or(1.0) as f32,
        data_type: obj
            .get("dataType")
            .map(DataType::from_value)
            .unwrap_or_default(),
        unit: str_field(obj, "unit").unwrap_or("").to_string(),
        topic: str_field(obj, "topic").unwrap_or("").trim().to_string(),
        register_slice: obj
            .get("registerSlice")
            .map(RegisterSlice::from_value)
            .unwrap_or_default(),
        poll_interval_ms: u32::try_from(poll_interval_ms).unwrap_or(u32::MAX),
        next_due_at_ms: 0,
    })
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Read an unsigned integer given as a number or a numeric string.
fn uint_field(obj: &Map<String, Value>, key: &str) -> Result<Option<u64>, ConfigError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(format!("'{}' must be an unsigned integer", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(format!("'{}' must be an unsigned integer", key))),
        Some(_) => Err(ConfigError::invalid(format!(
            "'{}' must be an unsigned integer",
            key
        ))),
    }
}

fn flag_field(obj: &Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
        _ => false,
    }
}
