//! aura-tracker - vehicle telemetry agent
//!
//! Samples sensors at 1 Hz, publishes telemetry frames over MQTT, and
//! buffers durably through outages.
//!
//! # Usage
//!
//! ```bash
//! # Run against the broker from aura.toml / env, with simulated sensors
//! cargo run --release -- --simulate
//!
//! # Point at a specific broker
//! AURA_MQTT_HOST=broker.example AURA_MQTT_PORT=1883 cargo run --release
//! ```
//!
//! # Environment Variables
//!
//! - `AURA_CONFIG`: Path to the TOML config file (default: ./aura.toml)
//! - `AURA_DEVICE_TAG`, `AURA_DATA_DIR`, `AURA_MQTT_HOST`, `AURA_MQTT_PORT`
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use aura_tracker::sensors::sim::run_simulated_source;
use aura_tracker::{AgentConfig, ProcessLock, Storage, Supervisor};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "aura-tracker")]
#[command(about = "AURA vehicle telemetry agent")]
#[command(version)]
struct CliArgs {
    /// Feed the pipeline from the built-in simulated sensor source
    /// instead of hardware adapters
    #[arg(long)]
    simulate: bool,

    /// Override the data directory from config
    #[arg(long)]
    data_dir: Option<String>,

    /// Start tracking immediately, regardless of the persisted flag
    #[arg(long)]
    force_start: bool,

    /// Wipe all persistent state (queue, settings) before starting.
    /// WARNING: buffered frames are lost!
    #[arg(long)]
    reset_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();

    let mut config = AgentConfig::load();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    info!(
        device = %config.device_tag,
        data_dir = %config.data_dir,
        "aura-tracker starting"
    );

    if args.reset_db {
        reset_data_directory(&config.data_dir)?;
    }

    // One instance per data directory; sled's own lock gives a much
    // less helpful error.
    let _lock = ProcessLock::claim(&config.data_dir)?;

    let storage = Storage::open(&config.data_dir)
        .map_err(|e| anyhow::anyhow!("could not open storage: {e}"))?;

    let supervisor = Supervisor::new(config, storage);

    // Sensor adapters. The simulated source stands in for the GNSS /
    // inertial / power adapters on bench setups.
    let sensors_cancel = CancellationToken::new();
    if args.simulate {
        tokio::spawn(run_simulated_source(
            supervisor.sensor_hub(),
            sensors_cancel.clone(),
        ));
    } else {
        warn!("No hardware adapters wired on this build; use --simulate for bench runs");
    }

    // Boot contract: resume tracking iff it was enabled at last death.
    if args.force_start {
        supervisor.start().await?;
    } else {
        supervisor.start_if_enabled().await?;
    }

    wait_for_shutdown().await?;

    info!("Shutdown signal received, stopping pipeline");
    sensors_cancel.cancel();
    supervisor.stop().await?;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("could not install SIGTERM handler")?;
        tokio::select! {
            result = ctrl_c => result.context("could not listen for ctrl-c")?,
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await.context("could not listen for ctrl-c")?;

    Ok(())
}

/// Remove the data directory before any storage is opened.
fn reset_data_directory(data_dir: &str) -> Result<()> {
    let path = std::path::Path::new(data_dir);
    if path.exists() {
        warn!(path = %path.display(), "Resetting persistent state");
        std::fs::remove_dir_all(path)
            .with_context(|| format!("could not remove data directory {}", path.display()))?;
    }
    Ok(())
}
