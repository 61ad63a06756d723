//! Endpoint set and round-robin selection.
//!
//! The endpoint list is rebuilt in full from the registry view on every
//! update. Rebuilt endpoints start healthy; health marks from probes and
//! forwarding failures only live until the next rebuild.
//!
//! Selection is round robin over the healthy subset using one process-wide
//! counter. Reading the subset and bumping the counter are not atomic
//! together, so concurrent selections may both land on the same endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pv6_models::NodeReport;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::BalancerError;

/// Default timeout of one health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One upstream proxy as seen by the ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyEndpoint {
    /// Node that reported the proxy.
    pub node_id: String,
    /// Where to dial the proxy.
    pub address: SocketAddr,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
}

struct EndpointSet {
    /// Bumped on every rebuild so stale probe results can be dropped.
    generation: u64,
    endpoints: Vec<ProxyEndpoint>,
}

/// Round-robin load balancer over the cluster's running proxies.
pub struct LoadBalancer {
    endpoints: RwLock<EndpointSet>,
    /// Round-robin counter.
    rr_counter: AtomicU64,
    probe_timeout: Duration,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a balancer with a custom probe timeout.
    pub fn with_timeout(probe_timeout: Duration) -> Self {
        Self {
            endpoints: RwLock::new(EndpointSet {
                generation: 0,
                endpoints: Vec::new(),
            }),
            rr_counter: AtomicU64::new(0),
            probe_timeout,
        }
    }

    /// Replace the endpoint list with every running instance in `reports`.
    ///
    /// Order follows `reports`, then each report's instance order.
    pub async fn update_endpoints(&self, reports: &[NodeReport]) {
        let now = Utc::now();
        let endpoints: Vec<ProxyEndpoint> = reports
            .iter()
            .flat_map(|report| {
                report.running().map(move |instance| ProxyEndpoint {
                    node_id: report.node_id.clone(),
                    address: instance.socket_addr(),
                    healthy: true,
                    last_check: now,
                })
            })
            .collect();

        let mut set = self.endpoints.write().await;
        set.generation += 1;
        set.endpoints = endpoints;

        info!(
            nodes = reports.len(),
            endpoints = set.endpoints.len(),
            "Updated proxy endpoints"
        );
    }

    /// Pick the next healthy endpoint.
    pub async fn select_endpoint(&self) -> Result<ProxyEndpoint, BalancerError> {
        let set = self.endpoints.read().await;
        if set.endpoints.is_empty() {
            return Err(BalancerError::NoProxyAvailable);
        }

        let healthy: Vec<&ProxyEndpoint> = set.endpoints.iter().filter(|e| e.healthy).collect();
        if healthy.is_empty() {
            return Err(BalancerError::NoHealthyProxyAvailable);
        }

        let n = self.rr_counter.fetch_add(1, Ordering::Relaxed);
        let index = (n % healthy.len() as u64) as usize;
        Ok(healthy[index].clone())
    }

    /// Mark every endpoint dialed at `address` unhealthy.
    pub async fn mark_unhealthy(&self, address: SocketAddr) {
        let mut set = self.endpoints.write().await;
        let now = Utc::now();
        for endpoint in set.endpoints.iter_mut().filter(|e| e.address == address) {
            endpoint.healthy = false;
            endpoint.last_check = now;
            warn!(address = %address, node_id = %endpoint.node_id, "Marked proxy unhealthy");
        }
    }

    /// Snapshot of the current endpoint list.
    pub async fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.endpoints.read().await.endpoints.clone()
    }

    /// Number of endpoints, and how many of them are healthy.
    pub async fn counts(&self) -> (usize, usize) {
        let set = self.endpoints.read().await;
        let healthy = set.endpoints.iter().filter(|e| e.healthy).count();
        (set.endpoints.len(), healthy)
    }

    /// Probe every endpoint once, concurrently.
    ///
    /// Results for a list that was replaced while probing are discarded.
    pub async fn probe_all(&self) {
        let (generation, targets) = {
            let set = self.endpoints.read().await;
            let targets: Vec<SocketAddr> = set.endpoints.iter().map(|e| e.address).collect();
            (set.generation, targets)
        };

        let mut probes = JoinSet::new();
        for (index, address) in targets.into_iter().enumerate() {
            let probe_timeout = self.probe_timeout;
            probes.spawn(async move {
                let result = match timeout(probe_timeout, TcpStream::connect(address)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("connect timeout".to_string()),
                };
                (index, address, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((index, address, result)) = joined else {
                continue;
            };

            let mut set = self.endpoints.write().await;
            if set.generation != generation {
                debug!(address = %address, "Endpoint list replaced, dropping probe result");
                continue;
            }
            let Some(endpoint) = set.endpoints.get_mut(index) else {
                continue;
            };

            endpoint.last_check = Utc::now();
            match result {
                Ok(()) => {
                    if !endpoint.healthy {
                        info!(address = %address, "Proxy recovered");
                    }
                    endpoint.healthy = true;
                }
                Err(e) => {
                    endpoint.healthy = false;
                    warn!(address = %address, error = %e, "Proxy failed health check");
                }
            }
        }
    }

    /// Probe all endpoints every `interval` until shutdown.
    pub async fn run_health_checks(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "Starting proxy health checks");
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; endpoints start healthy anyway.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health checks shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}
