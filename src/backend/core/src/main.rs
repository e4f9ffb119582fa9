//! Tributary Server - Main entry point
//!
//! Runs the event store and the controllers switched on in the configuration.

use anyhow::Context;
use tributary_core::{
    bundle::Bundle,
    config::Config,
    telemetry::{self, Telemetry},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("TRIBUTARY_CONFIG") {
        Ok(path) => Config::from_file(&path),
        Err(_) => Config::load(),
    }
    .context("invalid configuration")?;

    // Initialize observability
    telemetry::init_logging(&config.telemetry.log_level, &config.telemetry.log_format)?;
    if config.telemetry.metrics_enabled {
        telemetry::init_metrics(&config.telemetry.metrics_endpoint)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?config.transport.kind,
        "Starting Tributary Server"
    );

    let bundle = Bundle::start(&config, Telemetry::new("tributary-server")).await?;

    shutdown_signal().await;

    bundle.shutdown().await?;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
