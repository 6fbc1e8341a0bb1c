mod config;
mod telemetry;

use crate::config::{ServiceConfig, SinkKind};
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use anyhow::{Context, Result};
use common::domain::{InMemoryReadingSink, ReadingSink};
use common::postgres::{PostgresClient, PostgresReadingSink};
use ingestion_worker::IngestionWorker;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        sink = %config.sink,
        mqtt_mode = %config.mqtt_mode,
        "starting aqms-ingest service"
    );
    info!(config = ?config.redacted(), "configuration loaded");

    let exit_code = match run(&config).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{:#}", e), "service failed to start");
            1
        }
    };

    shutdown_telemetry(telemetry_providers);
    std::process::exit(exit_code);
}

/// Build the sink and worker, run until a shutdown signal, then tear down in order
async fn run(config: &ServiceConfig) -> Result<()> {
    let ingestion_config = config.ingestion_config()?;
    let (sink, postgres_client) = build_sink(config).await?;

    let worker = IngestionWorker::new(ingestion_config, sink)?;
    worker.start().await;

    shutdown_signal().await;

    // The worker goes first so no batch is in flight when the pool closes
    worker.stop().await;
    if let Some(client) = postgres_client {
        client.close();
    }

    info!("aqms-ingest service stopped");
    Ok(())
}

async fn build_sink(
    config: &ServiceConfig,
) -> Result<(Arc<dyn ReadingSink>, Option<PostgresClient>)> {
    match config.sink_kind()? {
        SinkKind::Memory => {
            info!("using in-memory reading sink, readings will not survive restarts");
            let sink: Arc<dyn ReadingSink> = Arc::new(InMemoryReadingSink::new());
            Ok((sink, None))
        }
        SinkKind::Postgres => {
            let postgres_config = config.postgres_config();
            let client = PostgresClient::new(&postgres_config)
                .context("failed to create PostgreSQL pool")?;
            client.ping().await.with_context(|| {
                format!(
                    "failed to reach PostgreSQL at {}:{}",
                    postgres_config.host, postgres_config.port
                )
            })?;

            let postgres_sink = PostgresReadingSink::new(client.clone());
            postgres_sink
                .ensure_schema()
                .await
                .context("failed to prepare sensor_data table")?;
            info!(
                host = %postgres_config.host,
                database = %postgres_config.database,
                "PostgreSQL reading sink ready"
            );

            let sink: Arc<dyn ReadingSink> = Arc::new(postgres_sink);
            Ok((sink, Some(client)))
        }
    }
}

/// Resolve on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => {
                error!(error = %e, "error setting up signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM signal");
            }
            Err(e) => {
                error!(error = %e, "error setting up SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
