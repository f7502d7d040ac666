//! Serial (RTU) transport
//!
//! Wraps a `tokio-serial` stream. "Connecting" means opening the port; a
//! faulted port is closed and reopened on the next connect.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::{LinkState, Transport, TransportStats};
use crate::error::{ModbusError, Result};

/// Serial transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialTransportConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub path: String,
    pub baud_rate: u32,
    /// 5..=8
    pub data_bits: u8,
    /// "none", "even" or "odd"
    pub parity: String,
    /// 1 or 2
    pub stop_bits: u8,
    /// Open timeout
    pub timeout: Duration,
}

impl SerialTransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(ModbusError::Config(
                "Serial device path cannot be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::Config("Baud rate cannot be zero".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ModbusError::Config(format!(
                "Invalid data bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.parity.to_lowercase().as_str(), "none" | "even" | "odd") {
            return Err(ModbusError::Config(format!(
                "Invalid parity: {}",
                self.parity
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ModbusError::Config(format!(
                "Invalid stop bits: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Serial transport implementation
pub struct SerialTransport {
    config: SerialTransportConfig,
    port: Option<SerialStream>,
    state: LinkState,
    stats: TransportStats,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.config.path)
            .field("baud_rate", &self.config.baud_rate)
            .field("state", &self.state)
            .finish()
    }
}

impl SerialTransport {
    pub fn new(config: SerialTransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            port: None,
            state: LinkState::Disconnected,
            stats: TransportStats::default(),
        })
    }

    fn drop_port(&mut self) {
        self.port = None;
        self.state = LinkState::Faulted;
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.config.path, self.config.baud_rate)
    }

    async fn connect(&mut self) -> Result<()> {
        self.stats.record_connection_attempt();
        self.state = LinkState::Connecting;

        debug!(
            "Opening serial port {} at {} baud",
            self.config.path, self.config.baud_rate
        );

        let builder = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .data_bits(self.config.data_bits())
            .parity(self.config.parity())
            .stop_bits(self.config.stop_bits())
            .timeout(self.config.timeout);

        match builder.open_native_async() {
            Ok(port) => {
                self.port = Some(port);
                self.state = LinkState::Connected;
                self.stats.record_successful_connection();
                info!("Opened serial port {}", self.config.path);
                Ok(())
            },
            Err(e) => {
                self.state = LinkState::Faulted;
                self.stats.record_failed_connection();
                Err(ModbusError::Transport(format!(
                    "Failed to open {}: {e}",
                    self.config.path
                )))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            self.stats.record_disconnection();
        }
        self.state = LinkState::Disconnected;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::Transport("Port not open".to_string()))?;

        match port.write_all(data).await {
            Ok(()) => {
                self.stats.bytes_sent += data.len() as u64;
                Ok(())
            },
            Err(e) => {
                self.drop_port();
                Err(ModbusError::Transport(format!("Serial write failed: {e}")))
            },
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], receive_timeout: Duration) -> Result<usize> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::Transport("Port not open".to_string()))?;

        match timeout(receive_timeout, port.read(buffer)).await {
            Ok(Ok(0)) => {
                self.drop_port();
                Err(ModbusError::Transport("Serial port closed".to_string()))
            },
            Ok(Ok(n)) => {
                self.stats.bytes_received += n as u64;
                Ok(n)
            },
            Ok(Err(e)) => {
                self.drop_port();
                Err(ModbusError::Transport(format!("Serial read failed: {e}")))
            },
            Err(_) => Err(ModbusError::Timeout(format!(
                "Serial read timed out after {receive_timeout:?}"
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn link_state(&self) -> LinkState {
        self.state
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
