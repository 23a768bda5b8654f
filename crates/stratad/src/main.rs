//! stratad - long-running Strata service
//!
//! Ticks cron roots, reconciles every domain on its cadence and runs table
//! maintenance until SIGINT or SIGTERM. In-flight runs finish before exit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use strata_core::metrics::METRICS;
use strata_core::{Runtime, StrataConfig};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "stratad")]
#[command(version, about = "Strata scheduling and reconciliation daemon", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "STRATA_CONFIG", default_value = "strata.toml")]
    config: PathBuf,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "STRATA_LOG_JSON")]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    strata_core::init_tracing(
        args.json,
        if args.verbose { Level::DEBUG } else { Level::INFO },
    );

    let config = StrataConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    let runtime = Runtime::build(config)
        .await
        .context("Failed to initialise Strata runtime")?;

    info!(config = %args.config.display(), "stratad started");
    runtime.run_until(shutdown_signal()).await;

    METRICS.flush();
    info!("stratad stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        tracing::warn!("could not register signal handlers; falling back to ctrl-c");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received ctrl-c");
}
