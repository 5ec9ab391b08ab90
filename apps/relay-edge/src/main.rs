use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_bus::RedisBus;
use relay_edge::telemetry::Telemetry;
use relay_edge::{router, AppState, Cli, EdgeConfig, EdgeWorker, WorkerHandle};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EdgeConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(&config.worker.worker_id)?;
    info!(
        listen_addr = %config.listen_addr,
        redis_url = %config.redis_url,
        worker_id = %config.worker.worker_id,
        channels = ?config.worker.channels,
        "starting relay edge worker"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: EdgeConfig, metrics: PrometheusHandle) -> Result<()> {
    let bus = RedisBus::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;
    let allowed_origins = config.worker.allowed_origins.clone();
    let worker = EdgeWorker::start(config.worker, Arc::new(bus))
        .await
        .context("failed to start edge worker")?;
    let handle = worker.handle();

    let state = Arc::new(AppState {
        worker: handle.clone(),
        allowed_origins,
        metrics,
    });
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("relay edge listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(handle, config.shutdown_grace))
        .await
        .context("server shutdown with error")?;

    worker.join().await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Disconnect every client before the listener stops, so open websockets do
/// not hold the graceful shutdown open.
async fn shutdown_signal(worker: WorkerHandle, grace: Duration) {
    let _ = signal::ctrl_c().await;
    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; disconnecting clients"
    );
    match tokio::time::timeout(grace, worker.shutdown()).await {
        Ok(Some(disconnected)) => info!(disconnected, "sent disconnects to backends"),
        Ok(None) => warn!("edge worker already stopped"),
        Err(_) => warn!("timed out flushing disconnects to backends"),
    }
}
