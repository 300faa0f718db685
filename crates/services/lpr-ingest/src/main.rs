//! LPR Push Ingest Binary
//!
//! Entry point for the push listener service. Detections are logged as JSON
//! lines until the process receives SIGINT or SIGTERM.

use anyhow::{Context, Result};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lpr_ingest::{config::Config, ChannelHandler, PlateListener};

/// Notifications buffered between the listener and the consumer task
const DETECTION_QUEUE_CAPACITY: usize = 256;

/// How long to wait for queued detections to be written on shutdown
const CONSUMER_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LPR push listener...");

    // Load configuration
    let config_path = std::env::var("LPR_CONFIG").ok();
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    let server_config = config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Configuration: prefixes={:?}, require_https={}, max_body_bytes={:?}, shared_secret={}",
        config.listen.prefixes,
        server_config.require_https(),
        server_config.max_body_bytes(),
        server_config.shared_secret().is_some()
    );

    let (handler, mut detections) = ChannelHandler::channel(DETECTION_QUEUE_CAPACITY);

    // Consumer task: one JSON line per detection
    let consumer_handle = tokio::spawn(async move {
        while let Some(notification) = detections.recv().await {
            match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("Failed to serialize detection: {}", e),
            }
        }
    });

    let listener = PlateListener::new(server_config, handler);
    listener.start().await.context("Failed to start listener")?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");

    listener.dispose().await;
    tracing::info!(metrics = ?listener.metrics(), "Listener disposed");

    // Dropping the listener drops the last sender, which ends the consumer
    drop(listener);
    if tokio::time::timeout(CONSUMER_DRAIN_TIMEOUT, consumer_handle).await.is_err() {
        tracing::warn!("Detection consumer did not drain in time");
    }

    tracing::info!("LPR push listener shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
