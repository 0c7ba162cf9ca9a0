//! ctxward - multi-session context-window governor.
//!
//! Wires a `Config` to a `Governor` (ctxward-core) and the four HTTP
//! listeners (ctxward-web), runs the drain loop and periodic housekeeping,
//! and waits for a termination signal to run the §5 shutdown sequence.
//! Exit codes follow §6: 0 clean shutdown, 1 unrecoverable startup failure,
//! 2 configuration error.

use clap::Parser;
use ctxward_core::{Config, FileStateStore, Governor, StateStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Interval between housekeeping sweeps (idle transition, eviction,
/// parallel-sessions re-evaluation). Not part of the external config
/// surface in §6; a fixed cadence keeps the sweep cheap and predictable.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// A session goes `active` -> `idle` after this long without telemetry.
/// Not named in §6 either; conservative default so a quiet session doesn't
/// flip to idle mid-conversation.
const IDLE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Parser)]
#[command(
    name = "ctxward",
    version,
    about = "Multi-session context-window governor",
    long_about = "Observes live token consumption across concurrent assistant sessions and \
                  drives each through a safety state machine that checkpoints, persists, and \
                  forces an explicit context clear before an implicit, lossy compaction occurs."
)]
struct Cli {
    /// Path to a YAML config file. Falls back to built-in defaults, then
    /// environment variable overrides (§6).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory (§6 "Persisted state layout").
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    let config = Arc::new(config);

    info!(
        ingest_port = config.ingest_port,
        api_port = config.api_port,
        health_port = config.health_port,
        prometheus_port = config.prometheus_port,
        data_dir = %config.data_dir.display(),
        "starting ctxward"
    );

    let store: Arc<dyn StateStore> = match FileStateStore::new(&config.data_dir).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open state store");
            return ExitCode::from(1);
        }
    };

    let governor = Arc::new(Governor::new(&config, store));
    let drain_handle = governor.spawn_drain_loop();

    let listeners = match ctxward_web::serve(governor.clone(), config.clone()).await {
        Ok(handles) => handles,
        Err(e) => {
            error!(error = %e, "failed to bind a listener");
            return ExitCode::from(1);
        }
    };

    let housekeeping_governor = governor.clone();
    let housekeeping_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            housekeeping_governor.sweep_idle_sessions(IDLE_AFTER).await;
        }
    });

    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "failed to install shutdown signal handler");
    }

    info!("shutdown signal received, draining");
    housekeeping_handle.abort();
    for handle in &listeners {
        handle.abort();
    }
    governor.shutdown(Duration::from_secs(5)).await;
    let _ = drain_handle.await;

    info!("ctxward exited cleanly");
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
