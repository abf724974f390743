//! Error types of the gateway.

use mbx_bridge_framework::BridgeError;
use thiserror::Error;

use crate::bus::ModbusStatus;
use crate::model::FunctionCode;

/// Errors raised while loading a Modbus configuration document.
///
/// A failed load never replaces the configuration in use.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration not found: {path}")]
    Missing { path: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Errors returned by bus transactions.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Modbus bus not initialized")]
    NotInitialized,

    #[error("Modbus bus busy")]
    Busy,

    #[error("Modbus transaction failed: {status}")]
    Transaction { status: ModbusStatus },

    #[error("Invalid bus configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Status byte reported for this error, if it maps onto one.
    pub fn status(&self) -> Option<ModbusStatus> {
        match self {
            BusError::Busy => Some(ModbusStatus::Busy),
            BusError::Transaction { status } => Some(*status),
            _ => None,
        }
    }
}

/// Errors of an inbound write command.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Invalid write payload '{payload}'")]
    InvalidPayload { payload: String },

    #[error("Function {0} does not accept writes")]
    UnsupportedFunction(FunctionCode),

    #[error("Modbus bus is gone")]
    BusGone,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors of the admin surface.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Mqtt(#[from] BridgeError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Gateway is shutting down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_status() {
        assert_eq!(BusError::Busy.status(), Some(ModbusStatus::Busy));
        assert_eq!(
            BusError::Transaction {
                status: ModbusStatus::InvalidCrc
            }
            .status(),
            Some(ModbusStatus::InvalidCrc)
        );
        assert_eq!(BusError::NotInitialized.status(), None);
    }

    #[test]
    fn test_error_display() {
        let err = BusError::Transaction {
            status: ModbusStatus::ResponseTimedOut,
        };
        assert_eq!(
            err.to_string(),
            "Modbus transaction failed: ResponseTimedOut(0xE2)"
        );

        let err = WriteError::UnsupportedFunction(FunctionCode::ReadHolding);
        assert_eq!(
            err.to_string(),
            "Function FC03-READ_HOLDING does not accept writes"
        );
    }
}
