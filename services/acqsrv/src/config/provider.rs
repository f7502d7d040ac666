//! Configuration provider and snapshot cache
//!
//! The loader is an external collaborator behind `ConfigProvider`. The core
//! only ever sees atomically consistent `Arc<Config>` snapshots through
//! `ConfigCache`; a refresh swaps the snapshot in one step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info};

use super::types::{Config, DeviceSpec, ParameterSpec, PollMode, ReadBlock};
use crate::error::{AcqError, Result};

/// Callback invoked with each new snapshot
pub type WatchCallback = Box<dyn Fn(Arc<Config>) + Send + Sync>;

/// External configuration source
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration
    async fn get_snapshot(&self) -> Result<Config>;

    /// Reload from the source of truth
    async fn refresh(&self) -> Result<Config>;

    /// Register a callback fired after every refresh
    fn watch(&self, callback: WatchCallback);
}

/// Fields an external device JSON file may override
#[derive(Debug, Deserialize)]
struct DeviceOverride {
    #[serde(default)]
    poll_mode: Option<PollMode>,
    #[serde(default)]
    read_blocks: Option<Vec<ReadBlock>>,
    #[serde(default)]
    parameters: Option<Vec<ParameterSpec>>,
    #[serde(default)]
    description: Option<String>,
}

/// YAML file provider with per-device JSON overrides
///
/// Environment variables prefixed `ACQSRV_` override file values, the way
/// the service has always been deployed.
pub struct FileConfigProvider {
    path: PathBuf,
    watchers: Mutex<Vec<WatchCallback>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn load(&self) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Yaml::file(&self.path))
            .merge(Env::prefixed("ACQSRV_").split("__"))
            .extract()?;

        let base_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        // Connections without devices receive the auto-create set
        if !config.auto_create_devices.is_empty() {
            for conn in &mut config.connections {
                if conn.devices.is_empty() {
                    conn.devices = config.auto_create_devices.clone();
                }
            }
        }

        // Resolve external device files; their fields win over inline ones
        for conn in &mut config.connections {
            for device in &mut conn.devices {
                if let Some(rel) = device.config_path.clone() {
                    let path = base_dir.join(&rel);
                    apply_device_override(device, &path)?;
                }
            }
        }

        Ok(config)
    }

    fn notify(&self, snapshot: &Arc<Config>) {
        for callback in self.watchers.lock().iter() {
            callback(Arc::clone(snapshot));
        }
    }
}

fn apply_device_override(device: &mut DeviceSpec, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AcqError::config(format!(
            "device '{}': cannot read {}: {e}",
            device.device_id,
            path.display()
        ))
    })?;
    let overrides: DeviceOverride = serde_json::from_str(&text)?;

    if let Some(poll_mode) = overrides.poll_mode {
        device.poll_mode = poll_mode;
    }
    if let Some(read_blocks) = overrides.read_blocks {
        device.read_blocks = read_blocks;
    }
    if let Some(parameters) = overrides.parameters {
        device.parameters = parameters;
    }
    if let Some(description) = overrides.description {
        device.description = description;
    }

    debug!(
        "Device '{}' configuration overridden from {}",
        device.device_id,
        path.display()
    );
    Ok(())
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn get_snapshot(&self) -> Result<Config> {
        self.load()
    }

    async fn refresh(&self) -> Result<Config> {
        let config = self.load()?;
        self.notify(&Arc::new(config.clone()));
        Ok(config)
    }

    fn watch(&self, callback: WatchCallback) {
        self.watchers.lock().push(callback);
    }
}

/// Read-mostly snapshot cache over a provider
///
/// The snapshot is replaced atomically on refresh; readers always see one
/// consistent config for the whole operation they are running.
pub struct ConfigCache {
    provider: Arc<dyn ConfigProvider>,
    snapshot: RwLock<Arc<Config>>,
}

impl ConfigCache {
    /// Load the initial snapshot from the provider
    pub async fn load(provider: Arc<dyn ConfigProvider>) -> Result<Self> {
        let snapshot = Arc::new(provider.get_snapshot().await?);
        info!(
            "Loaded configuration with {} connection(s)",
            snapshot.connections.len()
        );
        Ok(Self {
            provider,
            snapshot: RwLock::new(snapshot),
        })
    }

    /// The cached snapshot
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.snapshot.read())
    }

    /// Consult the provider and swap the cached snapshot
    pub async fn refresh(&self) -> Result<Arc<Config>> {
        let fresh = Arc::new(self.provider.refresh().await?);
        *self.snapshot.write() = Arc::clone(&fresh);
        info!(
            "Refreshed configuration with {} connection(s)",
            fresh.connections.len()
        );
        Ok(fresh)
    }
}
