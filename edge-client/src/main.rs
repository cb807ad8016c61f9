use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use carpool_edge_client::{logging, EdgeClient, EdgeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EdgeConfig::parse();

    // Initialize logging
    let _log_guard = logging::init(&config.logging)?;

    config.validate().context("Invalid configuration")?;

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A TLS crypto provider was already installed");
    }

    // Panics are fatal, including inside spawned reporter ticks.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        error!("Unhandled panic: {}", panic);
        default_hook(panic);
        std::process::exit(1);
    }));

    info!("Starting AI Carpool edge client");
    info!("Central server: {}", config.central.url);

    let client = EdgeClient::new(config)
        .start()
        .await
        .context("Failed to start edge client")?;

    info!("Edge client running as node {}", client.node_id());

    wait_for_shutdown().await;

    client.stop().await?;
    info!("Edge client shut down cleanly");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
