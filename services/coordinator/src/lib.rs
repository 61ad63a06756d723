//! # pv6-coordinator
//!
//! Cluster-side half of proxy-v6:
//!
//! - keeps the latest report of every agent ([`registry::NodeRegistry`])
//! - evicts nodes that stop reporting ([`sweeper::StaleNodeSweeper`])
//! - feeds the running proxies of all nodes to the ingress load balancer
//!
//! Every change to the registry view rebuilds the balancer's endpoint list.

pub mod api;
pub mod config;
pub mod registry;
pub mod state;
pub mod sweeper;

pub use config::Config;
pub use registry::{NodeRegistry, RegistryStats};
pub use state::AppState;
pub use sweeper::StaleNodeSweeper;
