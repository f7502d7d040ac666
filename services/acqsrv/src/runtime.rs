//! Service runtime
//!
//! Builds every component from one config snapshot and threads the context
//! through constructors explicitly; no process-wide globals. Startup is
//! best-effort: an invalid connection is refused, a slave that cannot bind
//! is skipped, a dead device waits for its first use to fail.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigCache};
use crate::manager::ConnectionManager;
use crate::pipeline::{spawn_pipeline, Pipeline, PipelineConfig, PipelineDeps};
use crate::poller::spawn_device_poller;
use crate::rules::{Rule, RuleContext, RuleEngine};
use crate::sinks::{Broker, TimeSeriesSink};
use crate::slave::SlaveManager;
use crate::tracker::ChangeTracker;

/// Runtime tuning
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub pipeline: PipelineConfig,
}

/// A started service instance
pub struct Runtime {
    shutdown: CancellationToken,
    manager: Arc<ConnectionManager>,
    slaves: Arc<SlaveManager>,
    pipeline: Pipeline,
    pollers: Vec<(JoinHandle<()>, Duration)>,
    rules_handle: JoinHandle<()>,
    stored_drain: JoinHandle<()>,
}

impl Runtime {
    /// Validate the snapshot, start slaves, pipeline, rule engine, and
    /// pollers
    pub async fn start(
        cache: &ConfigCache,
        options: RuntimeOptions,
        ts_sink: Arc<dyn TimeSeriesSink>,
        broker: Arc<dyn Broker>,
        rules: Vec<Arc<dyn Rule>>,
    ) -> crate::error::Result<Self> {
        let snapshot = cache.get();

        // Refuse invalid connections, run the rest
        let failures = snapshot.validate();
        for (conn_id, e) in &failures {
            error!("Refusing connection '{conn_id}': {e}");
        }
        let refused: Vec<&String> = failures.iter().map(|(id, _)| id).collect();

        let config = Arc::new(Config {
            connections: snapshot
                .connections
                .iter()
                .filter(|c| c.enabled && !refused.contains(&&c.conn_id))
                .cloned()
                .collect(),
            auto_create_devices: vec![],
        });

        let shutdown = CancellationToken::new();
        let manager = Arc::new(ConnectionManager::new(&config, shutdown.child_token()));
        let slaves = Arc::new(SlaveManager::new());
        let tracker = Arc::new(ChangeTracker::new());

        // Slaves are best-effort: a bind failure skips that slave only
        for conn in &config.connections {
            if let Err(e) = slaves.start_slave(conn, &shutdown).await {
                warn!("Skipping virtual slave for '{}': {e}", conn.conn_id);
            }
        }

        let (rules_tx, rules_rx) = mpsc::channel(options.pipeline.changed_capacity);

        let pipeline = spawn_pipeline(
            options.pipeline,
            PipelineDeps {
                config: Arc::clone(&config),
                tracker,
                slaves: Arc::clone(&slaves),
                ts_sink,
                broker,
                rules_tx,
            },
            shutdown.clone(),
        );

        let ctx = Arc::new(RuleContext::new(Arc::clone(&manager), Arc::clone(&config)));
        let rules_handle = RuleEngine::new(rules, ctx).spawn(rules_rx, shutdown.clone());

        let stored_drain = spawn_stored_drain(&pipeline, shutdown.clone());

        let mut pollers = Vec::new();
        for conn in &config.connections {
            let managed = manager.ensure(&conn.conn_id)?;
            let conn_arc = Arc::new(conn.clone());
            for device in &conn.devices {
                if let Some(handle) = spawn_device_poller(
                    Arc::clone(&conn_arc),
                    Arc::new(device.clone()),
                    Arc::clone(&managed.dispatcher),
                    pipeline.acquired_tx(),
                    shutdown.clone(),
                ) {
                    pollers.push((handle, conn.timeout()));
                }
            }
        }

        info!(
            "Runtime started: {} connection(s), {} slave(s), {} poller(s)",
            config.connections.len(),
            slaves.len(),
            pollers.len()
        );

        Ok(Self {
            shutdown,
            manager,
            slaves,
            pipeline,
            pollers,
            rules_handle,
            stored_drain,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn slaves(&self) -> &Arc<SlaveManager> {
        &self.slaves
    }

    /// Cancel everything; each loop gets its connection's timeout to exit
    /// before it is abandoned
    pub async fn shutdown(self) {
        info!("Runtime shutting down");
        self.shutdown.cancel();

        for (handle, timeout) in self.pollers {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => {},
                Err(_) => warn!("Poller did not exit within {timeout:?}, abandoning"),
            }
        }

        self.manager.shutdown().await;
        self.slaves.shutdown();
        self.pipeline.join().await;

        let _ = self.rules_handle.await;
        let _ = self.stored_drain.await;
        info!("Runtime shut down");
    }
}

fn spawn_stored_drain(pipeline: &Pipeline, shutdown: CancellationToken) -> JoinHandle<()> {
    let Some(mut stored_rx) = pipeline.take_stored_rx() else {
        return tokio::spawn(async {});
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = stored_rx.recv() => match received {
                    Some(stored) => debug!(
                        "Stored {} point(s) for '{}/{}'",
                        stored.points, stored.conn_id, stored.device_id
                    ),
                    None => break,
                },
            }
        }
    })
}
