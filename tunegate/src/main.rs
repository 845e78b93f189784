//! tunegate - Enigma2 to HLS session control plane.
//!
//! Accepts "play this channel" intents over HTTP, leases a tuner slot,
//! supervises an FFmpeg transcode into HLS and tears everything down when
//! the client leaves.

use std::path::PathBuf;

use tracing::{info, warn};
use tunegate::config::AppConfig;
use tunegate::logging::init_logging;
use tunegate::services::ServiceContainer;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _guard = init_logging(std::path::Path::new(&log_dir))
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    info!("Starting tunegate v{}", env!("CARGO_PKG_VERSION"));

    // Load and validate configuration; failures here are fatal.
    let config_path = std::env::var("TUNEGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("tunegate.toml"));
    let config = AppConfig::load(Some(&config_path))
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    info!(
        slots = ?config.tuner.slots,
        store = ?config.store.backend,
        "configuration loaded"
    );

    // Wire services.
    info!("Initializing services...");
    let container = ServiceContainer::new(config).await?;

    // Resume or abandon in-flight sessions before accepting new intents.
    let recovery = container.initialize().await?;
    if recovery.resumed > 0 || recovery.abandoned > 0 {
        info!(
            resumed = recovery.resumed,
            abandoned = recovery.abandoned,
            "session recovery complete"
        );
    }

    container.start_api_server()?;
    info!("tunegate started successfully");

    // Wait for shutdown signal.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    container.shutdown().await;
    info!("tunegate shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Wait for SIGTERM signal (non-Unix - never resolves, Ctrl+C handles it).
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
