//! Mesh Proxy Agent
//!
//! Sidecar agent that supervises the local data-plane proxy. Each
//! configuration update spawns a new proxy epoch; the previous epoch drains
//! once its successor is ready, so traffic never drops during a config
//! change.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mesh_proxy_agent::process::OsProxyRunner;
use mesh_proxy_agent::supervisor::EpochSupervisor;
use mesh_proxy_agent::{config, ProxyConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mesh proxy agent");
    info!(
        node_id = %config.node_id,
        cluster = %config.cluster,
        proxy_path = %config.proxy_path.display(),
        config_dir = %config.config_dir.display(),
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::new(OsProxyRunner::new(config.proxy_path.clone()));
    let (supervisor, handle) = EpochSupervisor::new(config, runner, shutdown_rx);
    let supervisor_handle = tokio::spawn(supervisor.run());

    // Apply a bootstrap configuration if one was provided; later updates
    // arrive through the same handle.
    if let Some(initial) = initial_config()? {
        if !handle.schedule_config_update(initial).await {
            warn!("Supervisor exited before the initial configuration was applied");
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    match supervisor_handle.await {
        Ok(errors) if errors.is_empty() => info!("Supervisor shut down cleanly"),
        Ok(errors) => {
            for (epoch, e) in errors {
                error!(epoch = %epoch, error = %e, "Teardown error");
            }
        }
        Err(e) => error!(error = %e, "Supervisor task panicked"),
    }

    info!("Proxy agent shutdown complete");
    Ok(())
}

/// Optional initial configuration from `MESH_INITIAL_CONFIG` (path to a
/// JSON file).
fn initial_config() -> Result<Option<ProxyConfig>> {
    let Ok(path) = std::env::var("MESH_INITIAL_CONFIG") else {
        return Ok(None);
    };

    let raw = std::fs::read(&path)
        .with_context(|| format!("failed to read initial config {path}"))?;
    let config: ProxyConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse initial config {path}"))?;
    Ok(Some(config))
}
