//! Model type definitions.
//!
//! Field names follow the JSON wire format exchanged between agents and the
//! coordinator.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

// =============================================================================
// Addresses
// =============================================================================

/// A routable IPv6 address discovered on a local interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Address {
    /// The address itself.
    pub ip: Ipv6Addr,
    /// Name of the interface the address is bound to.
    pub interface: String,
    /// Whether the address is globally routable.
    pub is_public: bool,
    /// When the address was discovered.
    pub created_at: DateTime<Utc>,
}

impl Ipv6Address {
    /// Create a record discovered now.
    pub fn new(ip: Ipv6Addr, interface: impl Into<String>, is_public: bool) -> Self {
        Self {
            ip,
            interface: interface.into(),
            is_public,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Proxy instances
// =============================================================================

/// Lifecycle status of a proxy instance.
///
/// `Starting -> Running | Error`, `Running -> Stopped | Error`. `Stopped` and
/// `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Starting => "starting",
            ProxyStatus::Running => "running",
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Error => "error",
        }
    }

    /// Whether an instance in this status still owns its port.
    ///
    /// Only an explicit stop releases a port; crashed and half-started
    /// instances keep theirs until they are stopped.
    pub fn holds_port(&self) -> bool {
        !matches!(self, ProxyStatus::Stopped)
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ProxyStatus::Starting),
            "running" => Ok(ProxyStatus::Running),
            "stopped" => Ok(ProxyStatus::Stopped),
            "error" => Ok(ProxyStatus::Error),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// Traffic counters for a proxy instance.
///
/// These are fed in from outside the instance manager; the manager only stores
/// them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyMetrics {
    #[serde(default)]
    pub requests_total: i64,
    #[serde(default)]
    pub bytes_transmitted: i64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_time_ms: f64,
}

/// One forward-proxy daemon bound to one address and port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInstance {
    /// `{address}-{port}`.
    pub id: String,
    /// Address the daemon is bound to.
    pub ipv6: Ipv6Address,
    /// Port the daemon is bound to.
    pub port: u16,
    pub status: ProxyStatus,
    pub started_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    #[serde(default)]
    pub metrics: ProxyMetrics,
}

impl ProxyInstance {
    /// Create a new instance in `Starting` status.
    pub fn starting(ipv6: Ipv6Address, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: instance_id(&ipv6.ip, port),
            ipv6,
            port,
            status: ProxyStatus::Starting,
            started_at: now,
            last_checked: now,
            metrics: ProxyMetrics::default(),
        }
    }

    /// Address a client dials to reach this instance.
    ///
    /// IPv4-mapped addresses are unwrapped so the dial goes out over IPv4.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(self.ipv6.ip).to_canonical(), self.port)
    }
}

/// Derive the instance identifier for an address and port.
pub fn instance_id(ip: &Ipv6Addr, port: u16) -> String {
    format!("{}-{}", ip, port)
}

// =============================================================================
// Access control
// =============================================================================

/// Who may connect to the proxies on a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Any source address.
    Open,
    /// Only the allow list, loopback, and the proxy's own address.
    #[default]
    Restricted,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Open => "open",
            AccessMode::Restricted => "restricted",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(AccessMode::Open),
            "restricted" => Ok(AccessMode::Restricted),
            other => Err(ModelError::InvalidAccessMode(other.to_string())),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Everything one host knows about its proxies, pushed to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub proxies: Vec<ProxyInstance>,
    pub updated_at: DateTime<Utc>,
}

impl NodeReport {
    /// Instances the host reported as `Running`.
    pub fn running(&self) -> impl Iterator<Item = &ProxyInstance> {
        self.proxies
            .iter()
            .filter(|p| p.status == ProxyStatus::Running)
    }
}
