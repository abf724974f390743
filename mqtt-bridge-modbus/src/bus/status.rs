//! Transaction status codes.

use std::fmt;

/// Outcome of a bus transaction.
///
/// Values `0x01..=0x04` are Modbus exception codes returned by the slave,
/// `0xE0..=0xE4` are raised by the master side. Other exception codes are
/// carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusStatus {
    Success,
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    InvalidSlaveId,
    InvalidFunction,
    ResponseTimedOut,
    InvalidCrc,
    Busy,
    Exception(u8),
}

impl ModbusStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ModbusStatus::Success,
            0x01 => ModbusStatus::IllegalFunction,
            0x02 => ModbusStatus::IllegalDataAddress,
            0x03 => ModbusStatus::IllegalDataValue,
            0x04 => ModbusStatus::SlaveDeviceFailure,
            0xE0 => ModbusStatus::InvalidSlaveId,
            0xE1 => ModbusStatus::InvalidFunction,
            0xE2 => ModbusStatus::ResponseTimedOut,
            0xE3 => ModbusStatus::InvalidCrc,
            0xE4 => ModbusStatus::Busy,
            other => ModbusStatus::Exception(other),
        }
    }

    /// Wire value of the status.
    pub fn code(&self) -> u8 {
        match self {
            ModbusStatus::Success => 0x00,
            ModbusStatus::IllegalFunction => 0x01,
            ModbusStatus::IllegalDataAddress => 0x02,
            ModbusStatus::IllegalDataValue => 0x03,
            ModbusStatus::SlaveDeviceFailure => 0x04,
            ModbusStatus::InvalidSlaveId => 0xE0,
            ModbusStatus::InvalidFunction => 0xE1,
            ModbusStatus::ResponseTimedOut => 0xE2,
            ModbusStatus::InvalidCrc => 0xE3,
            ModbusStatus::Busy => 0xE4,
            ModbusStatus::Exception(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ModbusStatus::Success
    }
}

impl fmt::Display for ModbusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusStatus::Success => return f.write_str("Success"),
            ModbusStatus::IllegalFunction => "IllegalFunction",
            ModbusStatus::IllegalDataAddress => "IllegalDataAddress",
            ModbusStatus::IllegalDataValue => "IllegalDataValue",
            ModbusStatus::SlaveDeviceFailure => "SlaveDeviceFailure",
            ModbusStatus::InvalidSlaveId => "InvalidSlaveID",
            ModbusStatus::InvalidFunction => "InvalidFunction",
            ModbusStatus::ResponseTimedOut => "ResponseTimedOut",
            ModbusStatus::InvalidCrc => "InvalidCRC",
            ModbusStatus::Busy => "Busy",
            ModbusStatus::Exception(_) => "Exception",
        };
        write!(f, "{}(0x{:02X})", name, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [0x00, 0x01, 0x02, 0x03, 0x04, 0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0x0B] {
            assert_eq!(ModbusStatus::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ModbusStatus::Success.to_string(), "Success");
        assert_eq!(ModbusStatus::InvalidCrc.to_string(), "InvalidCRC(0xE3)");
        assert_eq!(ModbusStatus::Busy.to_string(), "Busy(0xE4)");
        assert_eq!(ModbusStatus::from_code(0x0B).to_string(), "Exception(0x0B)");
    }
}
