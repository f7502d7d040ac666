//! TCP transport
//!
//! One `TcpStream` per transport instance. A broken stream is dropped on the
//! spot so the next connect starts from scratch.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{LinkState, Transport, TransportStats};
use crate::error::{ModbusError, Result};

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    pub host: String,
    pub port: u16,
    /// Connect timeout
    pub timeout: Duration,
}

impl TcpTransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ModbusError::Config("Host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ModbusError::Config("Port cannot be zero".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ModbusError::Config(
                "Timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout: Duration::from_secs(10),
        }
    }
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpTransportConfig,
    stream: Option<TcpStream>,
    state: LinkState,
    stats: TransportStats,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stream: None,
            state: LinkState::Disconnected,
            stats: TransportStats::default(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.state = LinkState::Faulted;
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        "tcp"
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.endpoint())
    }

    async fn connect(&mut self) -> Result<()> {
        self.stats.record_connection_attempt();
        self.state = LinkState::Connecting;

        let addr = self.endpoint();
        debug!("Connecting to TCP endpoint {addr}");

        match timeout(self.config.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY on {addr}: {e}");
                }
                self.stream = Some(stream);
                self.state = LinkState::Connected;
                self.stats.record_successful_connection();
                info!("Connected to TCP endpoint {addr}");
                Ok(())
            },
            Ok(Err(e)) => {
                self.state = LinkState::Faulted;
                self.stats.record_failed_connection();
                Err(ModbusError::Transport(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                self.state = LinkState::Faulted;
                self.stats.record_failed_connection();
                Err(ModbusError::Timeout(format!(
                    "Connection to {addr} timed out"
                )))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error during TCP shutdown: {e}");
            }
            self.stats.record_disconnection();
        }
        self.state = LinkState::Disconnected;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::Transport("Not connected".to_string()))?;

        match stream.write_all(data).await {
            Ok(()) => {
                self.stats.bytes_sent += data.len() as u64;
                Ok(())
            },
            Err(e) => {
                self.drop_stream();
                Err(ModbusError::Transport(format!("Send failed: {e}")))
            },
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], receive_timeout: Duration) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::Transport("Not connected".to_string()))?;

        match timeout(receive_timeout, stream.read(buffer)).await {
            Ok(Ok(0)) => {
                warn!("TCP connection closed by peer");
                self.drop_stream();
                Err(ModbusError::Transport(
                    "Connection closed by peer".to_string(),
                ))
            },
            Ok(Ok(n)) => {
                self.stats.bytes_received += n as u64;
                Ok(n)
            },
            Ok(Err(e)) => {
                self.drop_stream();
                Err(ModbusError::Transport(format!("Receive failed: {e}")))
            },
            Err(_) => Err(ModbusError::Timeout(format!(
                "Receive timed out after {receive_timeout:?}"
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn link_state(&self) -> LinkState {
        self.state
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = TcpTransportConfig::default();
        assert!(config.validate().is_ok());

        config.host = String::new();
        assert!(config.validate().is_err());

        config.host = "127.0.0.1".to_string();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_not_connected_initially() {
        let transport = TcpTransport::new(TcpTransportConfig::default()).unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.link_state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let mut transport = TcpTransport::new(TcpTransportConfig::default()).unwrap();
        let err = transport.send(&[0x00]).await.unwrap_err();
        assert!(matches!(err, ModbusError::Transport(_)));
    }

    #[tokio::test]
    async fn test_loopback_echo() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = TcpTransport::new(TcpTransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
        })
        .unwrap();

        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.send(&[0x01, 0x02, 0x03]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport
            .receive(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }
}
