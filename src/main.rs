use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use federation_node::api;
use federation_node::config::Config;
use federation_node::services::FederationNode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        "Starting federation node {} (lite: {}, heartbeat: {:?})",
        config.node.id,
        config.node.lite,
        config.heartbeat()
    );

    let node = Arc::new(FederationNode::from_config(config.clone()));

    // Initial load; failed sources are retried by the periodic refresh
    match node.refresh(None).await {
        Ok(report) => info!("Loaded {} logical table(s)", report.reloaded.len()),
        Err(e) => warn!("Initial refresh incomplete: {}", e),
    }

    node.start_background();

    // Create router with state
    let app: Router = api::create_router(node.clone());

    // Start server
    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("Invalid server address {}", config.server_address()))?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = node.shutdown().await {
        warn!("Shutdown completed with errors: {}", e);
    }
    info!("Federation node stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
