use anyhow::{Context, Result};
use dropline_storage::api::{start_api_server, AppState};
use dropline_storage::backend::{BackendFactory, DefaultBackendFactory};
use dropline_storage::coordinator::{ConfigEnvironment, EnvironmentSource, UploadCoordinator};
use dropline_storage::mirror::FsMirror;
use dropline_storage::records::{FileRecordService, MemoryFileRecords, PgFileRecords};
use dropline_storage::selector::BackendAvailability;
use dropline_storage::Config;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        availability = %BackendAvailability::from_config(&config),
        "Starting Dropline Storage Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // File records: PostgreSQL when configured, otherwise process memory
    let (records, db): (Arc<dyn FileRecordService>, Option<PgPool>) = match config.database.url {
        Some(_) => {
            let store = PgFileRecords::new(&config.database)
                .await
                .context("Failed to initialize file record store")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            let pool = store.pool().clone();
            (Arc::new(store) as Arc<dyn FileRecordService>, Some(pool))
        }
        None => {
            warn!("No database configured, file records are kept in memory");
            (Arc::new(MemoryFileRecords::new()) as Arc<dyn FileRecordService>, None)
        }
    };

    let mirror = Arc::new(FsMirror::new(config.mirror.root.clone()));
    info!(root = %mirror.root().display(), "Local mirror ready");

    let env: Arc<dyn EnvironmentSource> = Arc::new(ConfigEnvironment);
    let factory: Arc<dyn BackendFactory> = Arc::new(DefaultBackendFactory);

    let coordinator = UploadCoordinator::new(env.clone(), factory.clone(), records, mirror)
        .with_retry(
            Duration::from_millis(500),
            Duration::from_secs(config.upload.max_retry_elapsed_secs),
        );

    // Create API state
    let api_state = AppState {
        coordinator,
        env,
        factory,
        db,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Storage service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage service");

    api_handle.abort();

    info!("Storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
