//! proxy-v6 Agent Library
//!
//! The agent runs on every host that contributes proxies. It discovers the
//! host's public IPv6 addresses, runs one forward-proxy daemon per address,
//! and pushes the resulting instance list to the coordinator.
//!
//! ## Modules
//!
//! - `daemon`: adapter around the external proxy daemon (real and mock)
//! - `manager`: instance table, port allocation, startup verification
//! - `reporter`: periodic push of the node report to the coordinator
//! - `api`: management HTTP API

pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod manager;
pub mod reporter;

use std::sync::Arc;

use pv6_models::{Ipv6Address, ProxyInstance};
use tracing::{error, info};

pub use client::CoordinatorClient;
pub use config::{Config, DaemonKind};
pub use daemon::{AccessControl, DaemonLauncher, MockLauncher, TinyproxyLauncher};
pub use error::ManagerError;
pub use manager::{ManagerSettings, PortRange, ProxyManager};
pub use reporter::NodeIdentity;

impl Config {
    /// Access policy for new daemons.
    pub fn access_control(&self) -> AccessControl {
        AccessControl::new(self.proxy_mode, self.allowed_ips.clone())
    }

    /// Identity stamped on reports.
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            region: self.region.clone(),
        }
    }

    /// The daemon launcher selected by configuration.
    pub fn launcher(&self) -> Arc<dyn DaemonLauncher> {
        match self.daemon {
            DaemonKind::Tinyproxy => Arc::new(TinyproxyLauncher::new(&self.daemon_binary)),
            DaemonKind::Mock => Arc::new(MockLauncher::new()),
        }
    }
}

/// Start one proxy per address, one after another.
///
/// Failures are logged and skipped; the instances that reached `Running` are
/// returned.
pub async fn start_all(manager: &ProxyManager, addresses: Vec<Ipv6Address>) -> Vec<ProxyInstance> {
    let mut started = Vec::new();

    for address in addresses {
        let ip = address.ip;
        match manager.start_proxy(address).await {
            Ok(instance) => {
                info!(instance_id = %instance.id, "Started proxy");
                started.push(instance);
            }
            Err(e) => {
                error!(ip = %ip, code = e.code(), error = %e, "Failed to start proxy");
            }
        }
    }

    started
}
