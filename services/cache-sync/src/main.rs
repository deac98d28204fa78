use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_cache_sync::{Config, PgLatestState, RedisCache, Synchronizer};
use telemetry_pipeline::{health_router, serve_health, HealthCheck, SyncLiveness};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        poll_interval_ms = config.sync.poll_interval_ms,
        "Starting telemetry cache synchronizer"
    );

    init_metrics(config.service.metrics_port)?;

    let source = PgLatestState::new(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let cache = RedisCache::connect(&config.redis)
        .await
        .context("Failed to connect to Redis")?;

    let liveness = Arc::new(SyncLiveness::new(config.max_pass_age()));
    let shutdown = CancellationToken::new();

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

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down telemetry cache synchronizer");
        signal_token.cancel();
    });

    let synchronizer = Synchronizer::new(source, cache, config.sync.clone(), liveness);
    synchronizer.run(shutdown.clone()).await;

    shutdown.cancel();
    let _ = health_handle.await;

    info!("Telemetry cache synchronizer stopped");

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
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
