use std::sync::Arc;

use anyhow::{Context, Result};
use extask_client::{ClientConfig, EngineClient};
use extask_core::telemetry::{init_telemetry, TelemetryConfig};
use extask_core::{ExternalTaskWorker, Subscriptions, WorkerConfig};

mod handlers;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - LOG_FORMAT=json: structured output
    init_telemetry(&TelemetryConfig::from_env());

    let worker_config = WorkerConfig::from_env();
    let client_config = ClientConfig::from_env();
    client_config
        .validate_for(&worker_config)
        .context("Invalid engine client configuration")?;

    tracing::info!(
        worker_id = %worker_config.worker_id,
        engine_url = %client_config.base_url,
        max_in_flight = worker_config.max_in_flight,
        max_tasks = worker_config.max_tasks,
        "extask-worker starting"
    );

    let gateway = EngineClient::new(&client_config).context("Failed to create engine client")?;
    let worker = ExternalTaskWorker::new(Arc::new(gateway), worker_config)
        .context("Failed to create worker")?;

    let supervisor = worker.take_dispatch_errors().map(|mut errors| {
        tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                tracing::error!(task_id = %err.task_id(), error = %err, "Dispatch failed");
            }
        })
    });

    worker
        .subscribe(
            Subscriptions::new()
                .topic(handlers::ECHO_TOPIC, handlers::echo)
                .topic(handlers::FLAKY_TOPIC, handlers::flaky)
                .topic(handlers::VALIDATE_TOPIC, handlers::validate),
        )
        .context("Failed to subscribe topics")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Received shutdown signal");
        }
        _ = worker.stopped() => {}
    }

    let stopped = worker.stop().await;
    // Dispatch errors are already logged where they occur
    if let Some(supervisor) = supervisor {
        supervisor.abort();
    }
    stopped.context("Worker did not shut down cleanly")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
