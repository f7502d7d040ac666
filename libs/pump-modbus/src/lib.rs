//! Modbus protocol library for pump-station data acquisition
//!
//! Master (TCP and serial RTU) and TCP slave primitives: PDU and frame
//! codecs, typed value reconstruction under configurable word orders, a
//! transport abstraction, and a register bank served over TCP.

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod pdu;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::ModbusClient;
pub use codec::{DataType, Decoded, RawValue, WordOrder};
pub use error::{ModbusError, Result};
pub use frame::ModbusMode;
pub use pdu::{ExceptionCode, FunctionCode};
pub use server::{ModbusTcpServer, RegisterBank, RegisterTable};
pub use transport::{Transport, TransportStats};
