//! Cluster registry: the latest report from every node.
//!
//! Reports replace each other wholesale. A node disappears when the
//! staleness sweep finds its last report too old.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use pv6_models::NodeReport;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Aggregate counts over all known nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RegistryStats {
    pub total_nodes: usize,
    pub total_proxies: usize,
    /// Proxies reported as running.
    pub healthy_proxies: usize,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeReport>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `report` as the current state of `node_id`.
    ///
    /// Returns true when the node was not known before.
    pub async fn upsert(&self, node_id: &str, report: NodeReport) -> bool {
        let mut nodes = self.nodes.write().await;
        let proxies = report.proxies.len();
        let is_new = nodes.insert(node_id.to_string(), report).is_none();
        debug!(node_id, proxies, is_new, "Stored node report");
        is_new
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeReport> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// All reports, ordered by node id.
    pub async fn list(&self) -> Vec<NodeReport> {
        let nodes = self.nodes.read().await;
        let mut ids: Vec<&String> = nodes.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| nodes[id].clone()).collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let nodes = self.nodes.read().await;
        let total_proxies = nodes.values().map(|n| n.proxies.len()).sum();
        let healthy_proxies = nodes.values().map(|n| n.running().count()).sum();
        RegistryStats {
            total_nodes: nodes.len(),
            total_proxies,
            healthy_proxies,
        }
    }

    /// Drop every node whose last report is more than `threshold` older
    /// than `now`. Returns the evicted ids, sorted.
    pub async fn evict_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut nodes = self.nodes.write().await;
        let mut evicted: Vec<String> = nodes
            .iter()
            .filter(|(_, report)| now - report.updated_at > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        evicted.sort();

        for id in &evicted {
            if let Some(report) = nodes.remove(id) {
                warn!(
                    node_id = %id,
                    last_report = %report.updated_at,
                    "Removing stale node"
                );
            }
        }
        evicted
    }
}
