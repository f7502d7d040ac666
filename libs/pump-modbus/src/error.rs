//! Error handling for the Modbus protocol library
//!
//! Errors are grouped the way callers react to them: transport faults are
//! recoverable by reconnecting, timeouts are retryable at the caller's
//! discretion, exception PDUs come from the device and are never retried.

use thiserror::Error;

/// Modbus protocol library error type
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Transport-level fault (connection refused, reset, closed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered with an exception PDU
    #[error("Modbus exception 0x{0:02X}")]
    Exception(u8),

    /// Frame-level decode failure (bad MBAP, CRC mismatch, short frame)
    #[error("Frame error: {0}")]
    Frame(String),

    /// PDU-level decode failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Register slice shorter than the data type requires
    #[error("Truncated register data: {0}")]
    Truncated(String),

    /// Unsupported type, arity, or parameter combination
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Invalid request parameters (quantity out of range, empty write)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error at construction time
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for the Modbus protocol library
pub type Result<T> = std::result::Result<T, ModbusError>;

impl ModbusError {
    pub fn transport(msg: impl Into<String>) -> Self {
        ModbusError::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ModbusError::Timeout(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        ModbusError::Frame(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    /// Whether the underlying link must be torn down and re-established
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, ModbusError::Transport(_))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Transport(err.to_string())
    }
}
