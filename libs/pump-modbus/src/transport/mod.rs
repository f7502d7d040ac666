//! Transport layer
//!
//! A unified byte-stream interface over the physical links a Modbus dialog
//! can run on: TCP sockets, serial ports, and a scripted in-memory mock for
//! tests.

pub mod mock;
pub mod serial;
pub mod tcp;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use mock::{MockTransport, ScriptedExchange};
pub use serial::{SerialTransport, SerialTransportConfig};
pub use tcp::{TcpTransport, TcpTransportConfig};

/// Link state as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Byte counters and connection bookkeeping kept by every transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
    pub last_connection: Option<SystemTime>,
}

impl TransportStats {
    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connection = Some(SystemTime::now());
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
    }
}

/// Core transport trait
///
/// Implementations are not expected to be shareable; the caller provides the
/// exclusive access (the Modbus client serializes the whole request/response
/// exchange behind one lock, since the protocol is half-duplex per device).
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// Short type tag for logs ("tcp", "serial", "mock")
    fn transport_type(&self) -> &str;

    /// Human-readable endpoint description
    fn describe(&self) -> String;

    /// Establish the link
    async fn connect(&mut self) -> Result<()>;

    /// Tear the link down; idempotent
    async fn disconnect(&mut self) -> Result<()>;

    /// Send the whole buffer
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive up to `buffer.len()` bytes, waiting at most `timeout`
    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Whether the link is currently established
    fn is_connected(&self) -> bool;

    /// Current link state
    fn link_state(&self) -> LinkState;

    /// Snapshot of the byte counters
    fn stats(&self) -> TransportStats;
}
