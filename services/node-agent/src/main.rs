//! proxy-v6 Agent
//!
//! Runs on each host that contributes proxies.
//!
//! ## Startup
//!
//! 1. Scan interfaces for public IPv6 addresses (fatal if interfaces cannot be listed)
//! 2. Apply the access policy and start one daemon per address
//! 3. Start the report loop when a coordinator is configured
//! 4. Serve the management API until ctrl-c, then stop every daemon

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pv6_agent::api::{create_router, AgentState};
use pv6_agent::{reporter, start_all, Config, CoordinatorClient, ProxyManager};
use pv6_networking::AddressScanner;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        coordinator_url = ?config.coordinator_url,
        proxy_mode = %config.proxy_mode,
        daemon = ?config.daemon,
        "Starting proxy-v6 agent"
    );

    let manager = Arc::new(ProxyManager::new(
        config.manager_settings(),
        config.launcher(),
    ));
    manager.set_access_control(config.access_control()).await;
    if config.proxy_mode == pv6_models::AccessMode::Open {
        warn!("Proxy access mode is open, daemons accept connections from anywhere");
    }

    info!("Scanning for IPv6 addresses");
    let scanner = AddressScanner::new(config.exclude_interfaces.clone());
    let addresses = scanner
        .scan()
        .context("failed to scan network interfaces")?;
    info!(count = addresses.len(), "Found public IPv6 addresses");

    let started = start_all(&manager, addresses).await;
    info!(running = started.len(), "Initial proxies started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reporter_handle = match &config.coordinator_url {
        Some(url) => {
            let client = CoordinatorClient::new(url.clone())?;
            let identity = config.identity();
            let manager = Arc::clone(&manager);
            let interval = Duration::from_secs(config.report_interval_secs.max(1));
            let shutdown_rx = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                reporter::run_report_loop(client, identity, manager, interval, shutdown_rx).await
            }))
        }
        None => {
            warn!("No coordinator configured, reporting disabled");
            None
        }
    };

    let state = AgentState {
        manager: Arc::clone(&manager),
        identity: Arc::new(config.identity()),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Management API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("management API server error")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    manager.shutdown().await;

    info!("Agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
