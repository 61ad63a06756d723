//! # pv6-ingress
//!
//! Single entry point for clients of the proxy cluster. Spreads plain HTTP
//! proxy requests and CONNECT tunnels round robin over every healthy proxy
//! the cluster has reported.

pub mod error;
pub mod proxy;

pub use error::{BalancerError, IngressError};
pub use proxy::{
    IngressStats, IngressStatsSnapshot, Listener, ListenerConfig, LoadBalancer, ProxyEndpoint,
};
