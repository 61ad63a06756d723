//! proxy-v6 Coordinator
//!
//! Serves the registry API agents report to, and the ingress port clients
//! use as their HTTP proxy.

use std::sync::Arc;

use anyhow::{Context, Result};
use pv6_coordinator::{api, AppState, Config, StaleNodeSweeper};
use pv6_ingress::{Listener, ListenerConfig, LoadBalancer};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PV6_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting proxy-v6 coordinator");
    info!(
        listen_addr = %config.listen_addr,
        proxy_listen_addr = %config.proxy_listen_addr,
        stale_after_secs = config.stale_after.as_secs(),
        "Configuration loaded"
    );

    let balancer = Arc::new(LoadBalancer::with_timeout(config.health_timeout));

    let mut listener_config = ListenerConfig::new(config.proxy_listen_addr);
    listener_config.max_connections = config.max_connections;
    let listener = Listener::bind(listener_config, Arc::clone(&balancer))
        .await
        .with_context(|| format!("failed to bind ingress on {}", config.proxy_listen_addr))?;

    let state = AppState::new(Arc::clone(&balancer), listener.stats());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = Arc::new(listener);
    let ingress_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = listener.run(shutdown_rx).await {
                error!(error = %e, "Ingress listener failed");
            }
        }
    });

    let health_handle = tokio::spawn(
        Arc::clone(&balancer).run_health_checks(config.health_interval, shutdown_rx.clone()),
    );

    let sweeper = StaleNodeSweeper::new(state.clone(), config.sweep_interval, config.stale_after);
    let sweeper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweeper.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(state);
    let tcp = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Registry API listening");

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("registry API server error")?;

    info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [
        ("ingress", ingress_handle),
        ("health checks", health_handle),
        ("sweeper", sweeper_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("Coordinator shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
