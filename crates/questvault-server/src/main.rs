//! Questvault process entry point.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`questvault.yaml`, or the path given as the
//!    first argument) with environment overrides
//! 2. Initialize structured logging (tracing)
//! 3. Build the persistence runtime and start its background tasks
//! 4. Serve the monitoring endpoints until Ctrl-C
//! 5. Drain pending writes, stop maintenance, release the backend

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use questvault_db::{Runtime, StoreConfig};
use questvault_server::{AppState, ServerConfig, start_server};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "questvault.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, backend setup or the listener fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = load_config(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }

    info!(
        config = %path.display(),
        backend = ?config.backend.kind,
        cache = config.cache.enabled,
        "questvault-server starting"
    );

    let runtime = Arc::new(
        Runtime::build(&config)
            .await
            .context("failed to build persistence runtime")?,
    );
    runtime.start();

    let server = ServerConfig::from(&config.server);
    let state = Arc::new(AppState::new(Arc::clone(&runtime)));
    let served = start_server(&server, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        info!("Shutdown signal received");
    })
    .await;

    let drained = runtime.shutdown().await;
    info!(
        flushed = drained.success_count,
        failed = drained.error_count,
        "questvault-server shutdown complete"
    );
    served.context("monitoring server failed")
}

/// Read `path` if it exists, otherwise start from defaults. Environment
/// overrides apply either way.
fn load_config(path: &std::path::Path) -> anyhow::Result<StoreConfig> {
    if path.exists() {
        return StoreConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()));
    }
    let mut config = StoreConfig::default();
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    Ok(config)
}
