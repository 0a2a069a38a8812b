use anyhow::{Context, Result};
use std::sync::Arc;
use tiered_storage::{Config, RouteTable, ServedFiles, SqliteCatalog, TierCoordinator};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        cameras = config.storage.cameras.len(),
        "Starting tiered storage service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let catalog = Arc::new(
        SqliteCatalog::new(&config.database)
            .await
            .context("Failed to open catalog")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        catalog
            .run_migrations()
            .await
            .context("Failed to run catalog migrations")?;
    }

    if config.storage.cameras.is_empty() {
        warn!("No cameras configured, nothing to manage");
    }

    let served = ServedFiles::new();
    let routes = Arc::new(RouteTable::new(served.clone()));
    let coordinator = TierCoordinator::new(&config.storage, catalog, served, routes);

    coordinator
        .start_all()
        .await
        .context("Failed to start tier handlers")?;

    info!("Tiered storage service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down tiered storage service");

    coordinator.shutdown_all().await;

    info!("Tiered storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
