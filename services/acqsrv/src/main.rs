//! Acquisition service entry point
//!
//! Loads the configuration through the file provider, starts the runtime
//! with the stand-in sink adapters, and runs until SIGINT/SIGTERM. Real
//! deployments swap in their time-series and broker clients here.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use acqsrv::sinks::{LoggingBroker, LoggingTimeSeriesSink};
use acqsrv::{wait_for_shutdown, ConfigCache, FileConfigProvider, Runtime, RuntimeOptions};

/// Command line arguments for the acquisition service
#[derive(Parser)]
#[command(
    name = "acqsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Pump-station field-bus data acquisition service"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/acqsrv.yaml", env = "ACQSRV_CONFIG")]
    config: String,

    /// Override log filter (e.g. debug, acqsrv=trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Loading configuration from {}", args.config);
    let provider = Arc::new(FileConfigProvider::new(&args.config));
    let cache = ConfigCache::load(provider)
        .await
        .context("failed to load configuration")?;

    let runtime = Runtime::start(
        &cache,
        RuntimeOptions::default(),
        Arc::new(LoggingTimeSeriesSink),
        Arc::new(LoggingBroker),
        Vec::new(),
    )
    .await
    .context("failed to start runtime")?;

    wait_for_shutdown().await;
    runtime.shutdown().await;

    Ok(())
}
