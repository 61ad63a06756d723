//! Report loop pushing this node's proxies to the coordinator.
//!
//! Every tick builds a fresh [`NodeReport`] and posts it. A failed push is
//! logged and dropped; the next tick sends a newer report anyway.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pv6_models::NodeReport;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::CoordinatorClient;
use crate::manager::ProxyManager;

/// Identity stamped on every report.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub hostname: String,
    pub region: Option<String>,
}

/// Build the current report for this node.
pub async fn build_report(identity: &NodeIdentity, manager: &ProxyManager) -> NodeReport {
    NodeReport {
        node_id: identity.node_id.clone(),
        hostname: identity.hostname.clone(),
        region: identity.region.clone(),
        proxies: manager.get_instances().await,
        updated_at: Utc::now(),
    }
}

/// Run the report loop until shutdown.
pub async fn run_report_loop(
    client: CoordinatorClient,
    identity: NodeIdentity,
    manager: Arc<ProxyManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_id = %identity.node_id,
        interval_secs = interval.as_secs(),
        "Starting report loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let report = build_report(&identity, &manager).await;
                let running = report.running().count();

                match client.send_report(&report).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(
                            proxies = report.proxies.len(),
                            running,
                            "Report acknowledged"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Report failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Report failed repeatedly");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Report loop shutting down");
                    break;
                }
            }
        }
    }
}
