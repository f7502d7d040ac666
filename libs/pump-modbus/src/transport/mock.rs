//! Scripted in-memory transport for tests
//!
//! The mock replays a script of request/response exchanges. Each `send` is
//! matched against the next expected request (when one is scripted) and the
//! paired response is buffered for the following `receive`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use super::{LinkState, Transport, TransportStats};
use crate::error::{ModbusError, Result};

/// One scripted request/response pair
#[derive(Debug, Clone)]
pub struct ScriptedExchange {
    /// Expected request bytes; `None` accepts anything
    pub expect: Option<Vec<u8>>,
    /// Response bytes, or an error to surface on receive
    pub reply: std::result::Result<Vec<u8>, ModbusError>,
    /// Artificial response latency, for tests that need an in-flight window
    pub delay: Option<Duration>,
}

impl ScriptedExchange {
    pub fn reply(bytes: Vec<u8>) -> Self {
        Self {
            expect: None,
            reply: Ok(bytes),
            delay: None,
        }
    }

    pub fn expect_reply(expect: Vec<u8>, bytes: Vec<u8>) -> Self {
        Self {
            expect: Some(expect),
            reply: Ok(bytes),
            delay: None,
        }
    }

    pub fn delayed_reply(bytes: Vec<u8>, delay: Duration) -> Self {
        Self {
            expect: None,
            reply: Ok(bytes),
            delay: Some(delay),
        }
    }

    pub fn fail(err: ModbusError) -> Self {
        Self {
            expect: None,
            reply: Err(err),
            delay: None,
        }
    }
}

/// Scripted transport
#[derive(Debug, Default)]
pub struct MockTransport {
    script: VecDeque<ScriptedExchange>,
    pending_reply: Option<std::result::Result<Vec<u8>, ModbusError>>,
    pending_delay: Option<Duration>,
    sent: Vec<Vec<u8>>,
    connected: bool,
    /// Makes the next connect fail
    pub fail_connect: bool,
    stats: TransportStats,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<ScriptedExchange>) -> Self {
        Self {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, exchange: ScriptedExchange) {
        self.script.push_back(exchange);
    }

    /// All frames sent so far
    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn describe(&self) -> String {
        "mock://scripted".to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        self.stats.record_connection_attempt();
        if self.fail_connect {
            self.stats.record_failed_connection();
            return Err(ModbusError::Transport("Scripted connect failure".to_string()));
        }
        self.connected = true;
        self.stats.record_successful_connection();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.connected {
            self.stats.record_disconnection();
        }
        self.connected = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(ModbusError::Transport("Not connected".to_string()));
        }

        let exchange = self.script.pop_front().ok_or_else(|| {
            ModbusError::Transport(format!("Unscripted request: {data:02X?}"))
        })?;

        if let Some(expected) = &exchange.expect {
            if expected != data {
                return Err(ModbusError::Transport(format!(
                    "Request mismatch: expected {expected:02X?}, got {data:02X?}"
                )));
            }
        }

        self.sent.push(data.to_vec());
        self.stats.bytes_sent += data.len() as u64;
        self.pending_reply = Some(exchange.reply);
        self.pending_delay = exchange.delay;
        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(ModbusError::Transport("Not connected".to_string()));
        }

        if let Some(delay) = self.pending_delay.take() {
            tokio::time::sleep(delay).await;
        }

        match self.pending_reply.take() {
            Some(Ok(bytes)) => {
                let n = bytes.len().min(buffer.len());
                buffer[..n].copy_from_slice(&bytes[..n]);
                self.stats.bytes_received += n as u64;
                Ok(n)
            },
            Some(Err(e)) => {
                if e.is_transport_fault() {
                    self.connected = false;
                }
                Err(e)
            },
            None => Err(ModbusError::Timeout("No scripted reply pending".to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn link_state(&self) -> LinkState {
        if self.connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
