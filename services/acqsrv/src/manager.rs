//! Connection registry
//!
//! Specs are seeded at startup; connections and their dispatcher tasks are
//! created lazily on first use and shared by every caller. Opening the
//! transport is deferred to the first command, so a dead device at startup
//! costs nothing until someone needs it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, ConnectionSpec};
use crate::connection::{Connection, TransportFactory};
use crate::dispatch::Dispatcher;
use crate::error::{AcqError, Result};

/// A connection together with its serializing dispatcher
pub struct ManagedConnection {
    pub connection: Arc<Connection>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Registry of configured connections
pub struct ConnectionManager {
    specs: HashMap<String, Arc<ConnectionSpec>>,
    entries: DashMap<String, Arc<ManagedConnection>>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Seed the registry from enabled connections
    pub fn new(config: &Config, shutdown: CancellationToken) -> Self {
        let specs = config
            .connections
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.conn_id.clone(), Arc::new(c.clone())))
            .collect();

        Self {
            specs,
            entries: DashMap::new(),
            shutdown,
        }
    }

    pub fn spec(&self, conn_id: &str) -> Option<Arc<ConnectionSpec>> {
        self.specs.get(conn_id).cloned()
    }

    /// Get or lazily create the managed connection. Concurrent callers are
    /// coalesced: the entry lock ensures one constructor, the connection's
    /// own mutex ensures one connect.
    pub fn ensure(&self, conn_id: &str) -> Result<Arc<ManagedConnection>> {
        if let Some(entry) = self.entries.get(conn_id) {
            return Ok(Arc::clone(&entry));
        }

        let spec = self
            .specs
            .get(conn_id)
            .ok_or_else(|| AcqError::not_found(format!("connection '{conn_id}'")))?;

        let entry = self
            .entries
            .entry(conn_id.to_string())
            .or_insert_with(|| {
                debug!("Creating connection '{conn_id}'");
                let connection = Arc::new(Connection::new(Arc::clone(spec)));
                let dispatcher =
                    Dispatcher::spawn(Arc::clone(&connection), self.shutdown.child_token());
                Arc::new(ManagedConnection {
                    connection,
                    dispatcher,
                })
            });
        Ok(Arc::clone(&entry))
    }

    /// Register a connection with an injected transport factory, for tests
    /// and exotic links
    pub fn register_with_factory(
        &self,
        spec: Arc<ConnectionSpec>,
        factory: TransportFactory,
    ) -> Arc<ManagedConnection> {
        let conn_id = spec.conn_id.clone();
        let connection = Arc::new(Connection::with_transport_factory(spec, factory));
        let dispatcher = Dispatcher::spawn(Arc::clone(&connection), self.shutdown.child_token());
        let entry = Arc::new(ManagedConnection {
            connection,
            dispatcher,
        });
        self.entries.insert(conn_id, Arc::clone(&entry));
        entry
    }

    /// Close a connection; idempotent, the entry is recreated on next use
    pub async fn close(&self, conn_id: &str) {
        if let Some((_, entry)) = self.entries.remove(conn_id) {
            entry.connection.close().await;
            info!("Closed connection '{conn_id}'");
        }
    }

    /// Close everything and stop the dispatcher tasks
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for conn_id in ids {
            self.close(&conn_id).await;
        }
    }

    pub fn conn_ids(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegisterType, TransportSpec};
    use pump_modbus::WordOrder;

    fn config_with(conn_id: &str, enabled: bool) -> Config {
        Config {
            connections: vec![ConnectionSpec {
                conn_id: conn_id.to_string(),
                transport: TransportSpec::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 1502,
                },
                slave_id: 1,
                register_type: RegisterType::Holding,
                byte_order: WordOrder::Abcd,
                slave_port: None,
                poll_interval_ms: 1000,
                min_poll_interval_ms: None,
                timeout_ms: 1000,
                pause_after_connect_ms: 0,
                close_after_gather: false,
                enabled,
                devices: vec![],
            }],
            auto_create_devices: vec![],
        }
    }

    #[tokio::test]
    async fn test_ensure_is_lazy_and_shared() {
        let manager =
            ConnectionManager::new(&config_with("c1", true), CancellationToken::new());

        let first = manager.ensure("c1").unwrap();
        let second = manager.ensure("c1").unwrap();
        assert!(Arc::ptr_eq(&first.connection, &second.connection));
    }

    #[tokio::test]
    async fn test_unknown_connection_not_found() {
        let manager =
            ConnectionManager::new(&config_with("c1", true), CancellationToken::new());
        assert!(matches!(
            manager.ensure("missing"),
            Err(AcqError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_connection_not_registered() {
        let manager =
            ConnectionManager::new(&config_with("c1", false), CancellationToken::new());
        assert!(manager.ensure("c1").is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager =
            ConnectionManager::new(&config_with("c1", true), CancellationToken::new());
        manager.ensure("c1").unwrap();

        manager.close("c1").await;
        manager.close("c1").await;

        // Recreated on next use
        assert!(manager.ensure("c1").is_ok());
    }
}
