mod app;
mod change_feed;
mod config;
mod dead_letter;
mod ingest;
mod mailer;
mod metadata;
mod object_store;
mod store;

use anyhow::{Context, Result};
use app::App;
use config::{Config, ObjectStoreBackend};
use darkroom_pipeline::{normalize_notification, Topic};
use mailer::LogMailer;
use object_store::{MemoryObjectStore, ObjectStore, S3ObjectStore};
use std::sync::Arc;
use store::MemoryCatalog;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Darkroom Catalog Service"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize collaborators
    let object_store: Arc<dyn ObjectStore> = match config.object_store.backend {
        ObjectStoreBackend::Memory => {
            warn!("Using the in-memory object store; uploads only exist if fed in-process");
            Arc::new(MemoryObjectStore::new())
        }
        ObjectStoreBackend::S3 => Arc::new(
            S3ObjectStore::new(&config.object_store)
                .await
                .context("Failed to initialize S3 object store")?,
        ),
    };
    let catalog = Arc::new(MemoryCatalog::new(&config.catalog.table_name));
    let transport = Arc::new(LogMailer::new());

    // Wire the service
    let cancellation = CancellationToken::new();
    let application = App::build(
        &config,
        object_store,
        catalog,
        transport,
        cancellation.clone(),
    );

    // Feed raw provider notifications from stdin
    let feed_handle = tokio::spawn(run_source_feed(
        application.topic_handle(),
        cancellation.clone(),
    ));

    info!("Catalog service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down catalog service");

    cancellation.cancel();
    if let Err(e) = feed_handle.await {
        error!(error = %e, "Source feed ended abnormally");
    }
    application.shutdown().await;

    info!("Catalog service stopped");

    Ok(())
}

/// Read provider notifications from stdin, one JSON document per line,
/// normalize them, and publish onto the topic
async fn run_source_feed(topic: Arc<Topic>, cancellation: CancellationToken) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match normalize_notification(line) {
                        Ok(Some(message)) => {
                            topic.publish(message);
                        }
                        Ok(None) => {
                            debug!("Notification held no records");
                        }
                        Err(e) => {
                            warn!(error = %e, "Discarding unusable notification");
                        }
                    }
                }
                Ok(None) => {
                    info!("Input stream closed, no further notifications");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed reading input stream");
                    break;
                }
            }
        }
    }
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
