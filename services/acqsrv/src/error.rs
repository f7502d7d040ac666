//! Error handling for the acquisition service
//!
//! The taxonomy follows how callers recover: `InvalidSpec` is fatal for the
//! offending connection or device at load time, `Transport` means reconnect
//! on next use, `Timeout` is the caller's retry decision, `ModbusException`
//! came from the device and is never retried, `MissingRegisters` skips one
//! parameter for one tick.

use thiserror::Error;

use pump_modbus::ModbusError;

/// Acquisition service error type
#[derive(Error, Debug, Clone)]
pub enum AcqError {
    /// Configuration rejected at load; the connection or device never starts
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Connection closed, refused, or reset; recoverable by reconnect
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation exceeded its budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device returned an exception PDU
    #[error("Modbus exception 0x{0:02X}")]
    ModbusException(u8),

    /// Wire-level decode failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A parameter's registers were not covered by this tick's blocks
    #[error("Missing registers: {0}")]
    MissingRegisters(String),

    /// Configuration loading failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal channel failure (a stage went away)
    #[error("Channel error: {0}")]
    Channel(String),

    /// The request was cancelled before it touched the transport
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unknown connection, device, or parameter
    #[error("Not found: {0}")]
    NotFound(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the acquisition service
pub type Result<T> = std::result::Result<T, AcqError>;

impl AcqError {
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        AcqError::InvalidSpec(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AcqError::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AcqError::NotFound(msg.into())
    }

    pub fn missing_registers(msg: impl Into<String>) -> Self {
        AcqError::MissingRegisters(msg.into())
    }

    /// Whether the connection must be torn down and re-established
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, AcqError::Transport(_))
    }
}

impl From<ModbusError> for AcqError {
    fn from(err: ModbusError) -> Self {
        match err {
            ModbusError::Transport(msg) => AcqError::Transport(msg),
            ModbusError::Timeout(msg) => AcqError::Timeout(msg),
            ModbusError::Exception(code) => AcqError::ModbusException(code),
            ModbusError::Frame(msg) | ModbusError::Protocol(msg) => AcqError::Protocol(msg),
            ModbusError::Truncated(msg) => AcqError::MissingRegisters(msg),
            ModbusError::InvalidSpec(msg) => AcqError::InvalidSpec(msg),
            ModbusError::InvalidRequest(msg) => AcqError::Protocol(msg),
            ModbusError::Config(msg) => AcqError::InvalidSpec(msg),
        }
    }
}

impl From<std::io::Error> for AcqError {
    fn from(err: std::io::Error) -> Self {
        AcqError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AcqError {
    fn from(err: serde_json::Error) -> Self {
        AcqError::Config(format!("JSON error: {err}"))
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(err.to_string())
    }
}
