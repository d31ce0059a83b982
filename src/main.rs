//! # Production Optimizer - Main Entry Point
//!
//! Loads configuration, sets up logging and metrics, starts the optimizer's
//! background loops and waits for a shutdown signal.
//!
//! Configuration comes from `OPTIMIZER_CONFIG_PATH` (YAML or JSON, hot
//! reloaded) when set, otherwise from the built-in defaults. `OPTIMIZER_*`
//! environment variables override either source.

use anyhow::Context;
use production_optimizer::observability::{init_logging, install_prometheus_exporter};
use production_optimizer::{ConfigManager, OptimizerConfig, ProductionOptimizer};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_manager = match std::env::var("OPTIMIZER_CONFIG_PATH") {
        Ok(path) => Some(
            ConfigManager::new(&path)
                .await
                .with_context(|| format!("failed to load configuration from {}", path))?,
        ),
        Err(_) => None,
    };

    let config = match &config_manager {
        Some(manager) => manager.get_config().await.clone(),
        None => {
            let mut config = OptimizerConfig::default();
            config.apply_env_overrides().context("invalid environment override")?;
            config.validate().context("invalid default configuration")?;
            config
        }
    };

    init_logging(&config.logging).context("failed to initialize logging")?;
    info!("🚀 Starting production optimizer");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if config.metrics.prometheus_enabled {
        install_prometheus_exporter(&config.metrics).context("failed to install Prometheus exporter")?;
    }

    let optimizer = ProductionOptimizer::new(config).context("failed to build optimizer")?;
    if let Some(manager) = &config_manager {
        info!(path = %manager.config_path().display(), "Watching configuration file");
        optimizer.spawn_config_listener(manager.subscribe_to_changes());
    }

    if let Err(e) = optimizer.start().await {
        error!(error = %e, "Failed to start optimizer");
        optimizer.shutdown().await;
        return Err(e.into());
    }

    wait_for_shutdown_signal().await?;
    info!("🛑 Shutdown signal received, draining pending requests");

    match timeout(SHUTDOWN_TIMEOUT, optimizer.shutdown()).await {
        Ok(()) => {
            let status = optimizer.status().await;
            info!(
                total_requests = status.sla.total_requests,
                success_rate = status.sla.success_rate,
                cache_hit_ratio = status.cache.hit_ratio,
                "✅ Production optimizer shutdown complete"
            );
        }
        Err(_) => warn!("⚠️  Shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Received SIGINT (Ctrl+C)");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    Ok(())
}
