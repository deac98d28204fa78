use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_pipeline::{health_router, serve_health, ConsumerLiveness, HealthCheck, KafkaLog};
use telemetry_storage::{Config, Coordinator, EventStore, PgBatchWriter};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        mode = ?config.batch.mode,
        "Starting telemetry storage service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        EventStore::new(&config.database)
            .await
            .context("Failed to connect to PostgreSQL")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let log = KafkaLog::connect(config.kafka.clone()).context("Failed to initialize Kafka consumer")?;

    let liveness = Arc::new(ConsumerLiveness::new(config.max_commit_age()));
    let shutdown = CancellationToken::new();

    // Spawn health endpoint
    let router = health_router(
        config.service.name.clone(),
        vec![liveness.clone() as Arc<dyn HealthCheck>],
    );
    let health_config = config.health.clone();
    let health_shutdown = shutdown.clone();
    let health_handle = tokio::spawn(async move {
        let stopped = async move { health_shutdown.cancelled().await };
        if let Err(e) = serve_health(router, &health_config.host, health_config.port, stopped).await {
            error!(error = %e, "Health endpoint error");
        }
    });

    // Cancel the consumer loop on SIGINT/SIGTERM
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down telemetry storage service");
        signal_token.cancel();
    });

    info!("Telemetry storage service started successfully");

    let mut coordinator = Coordinator::new(
        log,
        PgBatchWriter::new(store.clone()),
        config.batch.clone(),
        liveness,
    );
    let result = coordinator.run(shutdown.clone()).await;

    // Stop the health endpoint whichever way the loop ended
    shutdown.cancel();
    let _ = health_handle.await;

    result.context("Telemetry consumer loop failed")?;

    info!("Telemetry storage service stopped");

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
