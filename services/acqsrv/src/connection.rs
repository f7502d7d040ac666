//! Upstream connection lifecycle
//!
//! One `Connection` per configured upstream link. The Modbus client and its
//! transport live behind one async mutex; holding it across the whole
//! command is what guarantees a single request in flight per connection.
//!
//! State walk: Idle -> Connecting -> Open, back to Idle through Closing on
//! an orderly close or through Faulted on a transport fault. The next
//! command after Idle reconnects from scratch.

use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pump_modbus::transport::{SerialTransportConfig, TcpTransportConfig};
use pump_modbus::{ModbusClient, ModbusMode, Transport};

use crate::config::{ConnectionSpec, RegisterType, TransportSpec};
use crate::dispatch::{Command, CommandOutcome};
use crate::error::{AcqError, Result};
use crate::model::BlockResult;

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Connecting,
    Open,
    Closing,
    Faulted,
}

/// Request counters for logs and tests
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub connects: u64,
    pub last_error: Option<String>,
}

/// Builds a fresh transport for each connect attempt
pub type TransportFactory =
    Box<dyn Fn() -> pump_modbus::Result<Box<dyn Transport>> + Send + Sync>;

/// One long-lived upstream link
pub struct Connection {
    spec: Arc<ConnectionSpec>,
    factory: TransportFactory,
    client: Mutex<Option<ModbusClient>>,
    phase: RwLock<LinkPhase>,
    stats: SyncMutex<ConnectionStats>,
}

impl Connection {
    pub fn new(spec: Arc<ConnectionSpec>) -> Self {
        let factory = default_factory(Arc::clone(&spec));
        Self::with_transport_factory(spec, factory)
    }

    /// Inject a transport factory, for tests and exotic links
    pub fn with_transport_factory(spec: Arc<ConnectionSpec>, factory: TransportFactory) -> Self {
        Self {
            spec,
            factory,
            client: Mutex::new(None),
            phase: RwLock::new(LinkPhase::Idle),
            stats: SyncMutex::new(ConnectionStats::default()),
        }
    }

    pub fn spec(&self) -> &Arc<ConnectionSpec> {
        &self.spec
    }

    pub fn conn_id(&self) -> &str {
        &self.spec.conn_id
    }

    pub fn phase(&self) -> LinkPhase {
        *self.phase.read()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }

    /// Run one command, connecting first if the link is down
    pub async fn execute(&self, command: &Command) -> Result<CommandOutcome> {
        let mut guard = self.client.lock().await;

        if guard.is_none() {
            self.open(&mut guard).await?;
        }
        let client = match guard.as_ref() {
            Some(client) => client,
            None => return Err(AcqError::Transport("Connection not open".to_string())),
        };

        self.stats.lock().requests += 1;
        let result = self.run(client, command).await;

        match &result {
            Ok(_) => self.stats.lock().successes += 1,
            Err(e) => {
                let mut stats = self.stats.lock();
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
            },
        }

        let fault = match &result {
            Err(e) => e.is_transport_fault(),
            Ok(CommandOutcome::Gathered(blocks)) => blocks
                .iter()
                .any(|b| matches!(&b.outcome, Err(e) if e.is_transport_fault())),
            Ok(_) => false,
        };
        let gather_done = matches!(command, Command::GatherBlocks { .. }) || result.is_err();
        if fault || (self.spec.close_after_gather && gather_done) {
            let phase = if fault {
                LinkPhase::Faulted
            } else {
                LinkPhase::Closing
            };
            self.teardown(&mut guard, phase).await;
        }

        result
    }

    /// Close the link; idempotent
    pub async fn close(&self) {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            self.teardown(&mut guard, LinkPhase::Closing).await;
        }
    }

    async fn open(&self, guard: &mut Option<ModbusClient>) -> Result<()> {
        *self.phase.write() = LinkPhase::Connecting;

        let transport = (self.factory)().map_err(|e| {
            *self.phase.write() = LinkPhase::Idle;
            AcqError::from(e)
        })?;
        let mode = match self.spec.transport {
            TransportSpec::Tcp { .. } => ModbusMode::Tcp,
            TransportSpec::Rtu { .. } => ModbusMode::Rtu,
        };
        let client = ModbusClient::new(transport, mode, self.spec.slave_id, self.spec.timeout());

        match client.connect().await {
            Ok(()) => {
                // Some devices reject requests right after accepting the link
                let pause = self.spec.pause_after_connect();
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                self.stats.lock().connects += 1;
                *self.phase.write() = LinkPhase::Open;
                info!("Connection '{}' open", self.spec.conn_id);
                *guard = Some(client);
                Ok(())
            },
            Err(e) => {
                // The instance is discarded so the next call retries fresh
                *self.phase.write() = LinkPhase::Idle;
                warn!("Connection '{}' failed to open: {e}", self.spec.conn_id);
                Err(e.into())
            },
        }
    }

    async fn teardown(&self, guard: &mut Option<ModbusClient>, via: LinkPhase) {
        *self.phase.write() = via;
        if let Some(client) = guard.take() {
            if let Err(e) = client.disconnect().await {
                debug!("Connection '{}' disconnect: {e}", self.spec.conn_id);
            }
        }
        *self.phase.write() = LinkPhase::Idle;
        debug!("Connection '{}' back to idle", self.spec.conn_id);
    }

    async fn run(&self, client: &ModbusClient, command: &Command) -> Result<CommandOutcome> {
        match command {
            Command::GatherBlocks {
                register_type,
                blocks,
            } => {
                let mut results = Vec::with_capacity(blocks.len());
                for block in blocks {
                    let outcome = self
                        .read_block(client, *register_type, block.start, block.count)
                        .await;
                    results.push(BlockResult {
                        block: *block,
                        outcome,
                    });
                }
                Ok(CommandOutcome::Gathered(results))
            },
            Command::ReadBlock {
                register_type,
                start,
                count,
            } => {
                let words = self.read_block(client, *register_type, *start, *count).await?;
                Ok(CommandOutcome::Words(words))
            },
            Command::WriteRegister { address, value } => {
                client.write_single_register(*address, *value).await?;
                Ok(CommandOutcome::Written)
            },
            Command::WriteRegisters { start, values } => {
                client.write_multiple_registers(*start, values).await?;
                Ok(CommandOutcome::Written)
            },
            Command::WriteCoil { address, on } => {
                client.write_single_coil(*address, *on).await?;
                Ok(CommandOutcome::Written)
            },
            Command::WriteCoils { start, values } => {
                client.write_multiple_coils(*start, values).await?;
                Ok(CommandOutcome::Written)
            },
        }
    }

    async fn read_block(
        &self,
        client: &ModbusClient,
        register_type: RegisterType,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let words = match register_type {
            RegisterType::Holding => client.read_holding_registers(start, count).await?,
            RegisterType::Input => client.read_input_registers(start, count).await?,
            RegisterType::Coil => bits_to_words(&client.read_coils(start, count).await?),
            RegisterType::DiscreteInput => {
                bits_to_words(&client.read_discrete_inputs(start, count).await?)
            },
        };
        Ok(words)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.spec.conn_id)
            .field("phase", &self.phase())
            .finish()
    }
}

fn bits_to_words(bits: &[bool]) -> Vec<u16> {
    bits.iter().map(|&b| u16::from(b)).collect()
}

fn default_factory(spec: Arc<ConnectionSpec>) -> TransportFactory {
    Box::new(move || match &spec.transport {
        TransportSpec::Tcp { host, port } => {
            let transport = pump_modbus::transport::TcpTransport::new(TcpTransportConfig {
                host: host.clone(),
                port: *port,
                timeout: spec.timeout(),
            })?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        },
        TransportSpec::Rtu {
            serial_port,
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        } => {
            let transport =
                pump_modbus::transport::SerialTransport::new(SerialTransportConfig {
                    path: serial_port.clone(),
                    baud_rate: *baud_rate,
                    data_bits: *data_bits,
                    parity: parity.clone(),
                    stop_bits: *stop_bits,
                    timeout: spec.timeout(),
                })?;
            Ok(Box::new(transport) as Box<dyn Transport>)
        },
    })
}
