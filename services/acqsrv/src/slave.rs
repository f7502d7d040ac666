//! Virtual slave fan-out
//!
//! Every enabled connection gets a local Modbus TCP server whose register
//! image mirrors the latest acquisition. Explicit ports are honoured or the
//! slave fails; unset ports are probed from [60000, 65535]. External client
//! writes stay in the local image.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pump_modbus::{ModbusTcpServer, RegisterBank, RegisterTable};

use crate::config::{ConnectionSpec, RegisterType};
use crate::error::{AcqError, Result};

/// Auto-allocation range for slave ports
const AUTO_PORT_MIN: u16 = 60_000;
const AUTO_PORT_MAX: u16 = 65_535;

/// Probe attempts before giving up on auto allocation
const AUTO_PORT_ATTEMPTS: u32 = 1000;

/// A running local slave
#[derive(Debug)]
pub struct SlaveHandle {
    conn_id: String,
    bank: Arc<RegisterBank>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl SlaveHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn bank(&self) -> Arc<RegisterBank> {
        Arc::clone(&self.bank)
    }
}

/// Registry of local slaves, one per upstream connection
#[derive(Debug, Default)]
pub struct SlaveManager {
    slaves: DashMap<String, Arc<SlaveHandle>>,
    /// Explicit ports claimed in this process; a second claim fails fast
    claimed_ports: Mutex<HashSet<u16>>,
}

impl SlaveManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the slave for a connection per its port policy
    pub async fn start_slave(
        &self,
        spec: &ConnectionSpec,
        shutdown: &CancellationToken,
    ) -> Result<Arc<SlaveHandle>> {
        let bank = Arc::new(RegisterBank::new());

        let server = match spec.slave_port {
            Some(port) if port > 0 => self.bind_explicit(spec, port, &bank).await?,
            _ => self.bind_auto(spec, &bank).await?,
        };

        let addr = server.local_addr();
        let cancel = shutdown.child_token();
        tokio::spawn(server.run(cancel.clone()));

        let handle = Arc::new(SlaveHandle {
            conn_id: spec.conn_id.clone(),
            bank,
            addr,
            cancel,
        });
        self.slaves.insert(spec.conn_id.clone(), Arc::clone(&handle));

        info!("Virtual slave for '{}' serving on {addr}", spec.conn_id);
        Ok(handle)
    }

    async fn bind_explicit(
        &self,
        spec: &ConnectionSpec,
        port: u16,
        bank: &Arc<RegisterBank>,
    ) -> Result<ModbusTcpServer> {
        // No auto-fallback for explicit ports: a conflict is a report
        if !self.claimed_ports.lock().insert(port) {
            return Err(AcqError::InvalidSpec(format!(
                "slave port {port} for '{}' already claimed by another slave",
                spec.conn_id
            )));
        }

        let addr: SocketAddr = format!("127.0.0.1:{port}")
            .parse()
            .map_err(|e| AcqError::Internal(format!("bad slave address: {e}")))?;

        match ModbusTcpServer::bind(addr, Arc::clone(bank)).await {
            Ok(server) => Ok(server),
            Err(e) => {
                self.claimed_ports.lock().remove(&port);
                Err(AcqError::Transport(format!(
                    "slave for '{}' failed to bind {addr}: {e}",
                    spec.conn_id
                )))
            },
        }
    }

    async fn bind_auto(
        &self,
        spec: &ConnectionSpec,
        bank: &Arc<RegisterBank>,
    ) -> Result<ModbusTcpServer> {
        let span = u32::from(AUTO_PORT_MAX - AUTO_PORT_MIN) + 1;
        let mut port =
            AUTO_PORT_MIN + rand::thread_rng().gen_range(0..span) as u16;

        for _ in 0..AUTO_PORT_ATTEMPTS {
            if !self.claimed_ports.lock().contains(&port) {
                let addr: SocketAddr = format!("127.0.0.1:{port}")
                    .parse()
                    .map_err(|e| AcqError::Internal(format!("bad slave address: {e}")))?;

                match ModbusTcpServer::bind(addr, Arc::clone(bank)).await {
                    Ok(server) => {
                        self.claimed_ports.lock().insert(port);
                        return Ok(server);
                    },
                    Err(e) => {
                        debug!("Port {port} unavailable for '{}': {e}", spec.conn_id);
                    },
                }
            }

            // Advance with wraparound back into the range
            port = if port >= AUTO_PORT_MAX {
                AUTO_PORT_MIN
            } else {
                port + 1
            };
        }

        Err(AcqError::Transport(format!(
            "no free slave port for '{}' after {AUTO_PORT_ATTEMPTS} probes",
            spec.conn_id
        )))
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<SlaveHandle>> {
        self.slaves.get(conn_id).map(|entry| Arc::clone(&entry))
    }

    /// Mirror one successfully read upstream block into the slave image.
    /// The write is per-block atomic: clients see the image before or after
    /// the block, never a mix.
    pub fn apply_block(
        &self,
        conn_id: &str,
        register_type: RegisterType,
        start: u16,
        words: &[u16],
    ) {
        if let Some(handle) = self.slaves.get(conn_id) {
            handle
                .bank
                .apply_block(table_for(register_type), start, words);
        }
    }

    /// Stop every slave
    pub fn shutdown(&self) {
        for entry in self.slaves.iter() {
            entry.cancel.cancel();
            debug!("Stopped virtual slave for '{}'", entry.conn_id);
        }
        self.slaves.clear();
        self.claimed_ports.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }
}

fn table_for(register_type: RegisterType) -> RegisterTable {
    match register_type {
        RegisterType::Holding => RegisterTable::Holding,
        RegisterType::Input => RegisterTable::Input,
        RegisterType::Coil => RegisterTable::Coils,
        RegisterType::DiscreteInput => RegisterTable::DiscreteInputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportSpec;
    use pump_modbus::WordOrder;

    fn spec(conn_id: &str, slave_port: Option<u16>) -> ConnectionSpec {
        ConnectionSpec {
            conn_id: conn_id.to_string(),
            transport: TransportSpec::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
            slave_id: 1,
            register_type: RegisterType::Holding,
            byte_order: WordOrder::Abcd,
            slave_port,
            poll_interval_ms: 1000,
            min_poll_interval_ms: None,
            timeout_ms: 10_000,
            pause_after_connect_ms: 0,
            close_after_gather: false,
            enabled: true,
            devices: vec![],
        }
    }

    #[tokio::test]
    async fn test_auto_port_lands_in_range() {
        let manager = SlaveManager::new();
        let shutdown = CancellationToken::new();

        let handle = manager
            .start_slave(&spec("c1", None), &shutdown)
            .await
            .unwrap();
        assert!(handle.port() >= AUTO_PORT_MIN);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_explicit_port_conflict_fails_without_fallback() {
        let manager = SlaveManager::new();
        let shutdown = CancellationToken::new();

        // Grab a free port first so the explicit claim is deterministic
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        manager
            .start_slave(&spec("c1", Some(port)), &shutdown)
            .await
            .unwrap();

        let err = manager
            .start_slave(&spec("c2", Some(port)), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, AcqError::InvalidSpec(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_apply_block_reaches_bank() {
        let manager = SlaveManager::new();
        let shutdown = CancellationToken::new();

        let handle = manager
            .start_slave(&spec("c1", None), &shutdown)
            .await
            .unwrap();

        manager.apply_block("c1", RegisterType::Holding, 0, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(handle.bank().read_holding(0, 3), vec![0xAA, 0xBB, 0xCC]);

        // Unknown connection is a no-op
        manager.apply_block("nope", RegisterType::Holding, 0, &[1]);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_coil_blocks_map_to_bools() {
        let manager = SlaveManager::new();
        let shutdown = CancellationToken::new();

        let mut coil_spec = spec("c1", None);
        coil_spec.register_type = RegisterType::Coil;
        let handle = manager.start_slave(&coil_spec, &shutdown).await.unwrap();

        manager.apply_block("c1", RegisterType::Coil, 0, &[0, 1, 5]);
        assert_eq!(
            handle.bank().read_coils(0, 3),
            vec![false, true, true]
        );

        shutdown.cancel();
    }
}
