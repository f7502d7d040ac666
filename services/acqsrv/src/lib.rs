//! Pump-station field-bus data acquisition service
//!
//! Polls Modbus devices over TCP and serial RTU, parses registers into
//! typed parameters, detects changes, feeds a time-series sink and a
//! message broker, mirrors every register image on a local Modbus TCP
//! slave, and drives a rule engine off parameter changes.

// Module declarations
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod poller;
pub mod rules;
pub mod runtime;
pub mod sinks;
pub mod slave;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, ConfigCache, ConfigProvider, FileConfigProvider};
pub use error::{AcqError, Result};
pub use runtime::{Runtime, RuntimeOptions};

use tracing::error;

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!(
                    "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
