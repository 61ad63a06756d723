//! HTTP proxy ingress.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> LoadBalancer::select_endpoint
//!              |
//!              +-- non-CONNECT -> Forwarder -> upstream proxy -> origin
//!              +-- CONNECT     -> tunnel::open -> upgrade -> tunnel::splice
//! ```
//!
//! The balancer's endpoint list is replaced by whoever owns the cluster
//! view, and probed in the background by [`LoadBalancer::run_health_checks`].
//!
//! ## Usage
//!
//! ```ignore
//! let balancer = Arc::new(LoadBalancer::new());
//! balancer.update_endpoints(&reports).await;
//!
//! let config = ListenerConfig::new("[::]:8888".parse()?);
//! let listener = Arc::new(Listener::bind(config, Arc::clone(&balancer)).await?);
//! listener.run(shutdown_rx).await?;
//! ```

mod balancer;
mod forward;
mod listener;
pub mod tunnel;

pub use balancer::{LoadBalancer, ProxyEndpoint, DEFAULT_PROBE_TIMEOUT};
pub use forward::{proxy_request, target_url, Forwarder, ProxyBody};
pub use listener::{IngressStats, IngressStatsSnapshot, Listener, ListenerConfig};
