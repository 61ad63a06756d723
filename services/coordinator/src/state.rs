//! Application state shared across request handlers and background tasks.

use std::sync::Arc;

use pv6_ingress::{IngressStats, LoadBalancer};
use tokio::sync::Mutex;

use crate::registry::NodeRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: NodeRegistry,
    balancer: Arc<LoadBalancer>,
    ingress_stats: Arc<IngressStats>,
    /// Held across list and apply so rebuilds land in registry order.
    rebuild: Mutex<()>,
}

impl AppState {
    pub fn new(balancer: Arc<LoadBalancer>, ingress_stats: Arc<IngressStats>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry: NodeRegistry::new(),
                balancer,
                ingress_stats,
                rebuild: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.inner.balancer
    }

    pub fn ingress_stats(&self) -> &IngressStats {
        &self.inner.ingress_stats
    }

    /// Rebuild the balancer's endpoints from the current registry view.
    ///
    /// Concurrent callers are serialized, so the last rebuild to finish
    /// always reflects the newest registry state.
    pub async fn refresh_balancer(&self) {
        let _guard = self.inner.rebuild.lock().await;
        let reports = self.inner.registry.list().await;
        self.inner.balancer.update_endpoints(&reports).await;
    }
}
