//! Configuration for the agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pv6_models::AccessMode;

use crate::manager::{ManagerSettings, PortRange};

/// Which daemon adapter the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    /// The real `tinyproxy` executable.
    Tinyproxy,
    /// In-process fake that listens on the bind address.
    Mock,
}

impl FromStr for DaemonKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tinyproxy" => Ok(DaemonKind::Tinyproxy),
            "mock" => Ok(DaemonKind::Mock),
            other => bail!("unknown daemon kind: {other}"),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Management API listen address.
    pub listen_addr: SocketAddr,

    /// Ports handed out to proxy daemons.
    pub port_range: PortRange,

    /// Coordinator base URL. Reporting is disabled when unset.
    pub coordinator_url: Option<String>,

    /// Identity used in reports.
    pub node_id: String,

    /// Local hostname.
    pub hostname: String,

    /// Free-form region label.
    pub region: Option<String>,

    /// Interface name fragments to skip during discovery.
    pub exclude_interfaces: Vec<String>,

    /// Source addresses allowed in restricted mode.
    pub allowed_ips: Vec<String>,

    pub proxy_mode: AccessMode,

    /// Report push interval in seconds.
    pub report_interval_secs: u64,

    pub daemon: DaemonKind,

    /// Path or name of the daemon executable.
    pub daemon_binary: PathBuf,

    /// Directory for generated config, log and pid files.
    pub runtime_dir: PathBuf,

    pub startup_attempts: u32,
    pub startup_interval_ms: u64,
    pub probe_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr =
            parse_or(&lookup, "PV6_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        let low = parse_or(&lookup, "PV6_PROXY_PORT_START", 10000u16)?;
        let high = parse_or(&lookup, "PV6_PROXY_PORT_END", 20000u16)?;
        let port_range = PortRange::new(low, high)
            .with_context(|| format!("invalid proxy port range {low}-{high}"))?;

        let coordinator_url = lookup("PV6_COORDINATOR_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let node_id = lookup("PV6_NODE_ID")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| hostname.clone());

        let region = lookup("PV6_REGION").filter(|s| !s.is_empty());

        let exclude_interfaces = lookup("PV6_EXCLUDE_INTERFACES")
            .map(|s| split_list(&s))
            .unwrap_or_else(|| vec!["docker".into(), "veth".into(), "br-".into()]);

        let mut allowed_ips = lookup("PV6_ALLOWED_IPS")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        let proxy_mode = parse_or(&lookup, "PV6_PROXY_MODE", AccessMode::Restricted)?;

        // The ingress dials the proxies from the coordinator host.
        if proxy_mode == AccessMode::Restricted && allowed_ips.is_empty() {
            if let Some(host) = coordinator_url.as_deref().and_then(coordinator_host) {
                allowed_ips.push(host);
            }
        }

        let report_interval_secs = parse_or(&lookup, "PV6_REPORT_INTERVAL_SECS", 30u64)?;
        let daemon = parse_or(&lookup, "PV6_DAEMON", DaemonKind::Tinyproxy)?;
        let daemon_binary =
            PathBuf::from(lookup("PV6_DAEMON_BINARY").unwrap_or_else(|| "tinyproxy".into()));
        let runtime_dir = PathBuf::from(lookup("PV6_RUNTIME_DIR").unwrap_or_else(|| "/tmp".into()));
        let startup_attempts = parse_or(&lookup, "PV6_STARTUP_ATTEMPTS", 5u32)?;
        let startup_interval_ms = parse_or(&lookup, "PV6_STARTUP_INTERVAL_MS", 2000u64)?;
        let probe_timeout_ms = parse_or(&lookup, "PV6_PROBE_TIMEOUT_MS", 3000u64)?;
        let log_level = lookup("PV6_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            port_range,
            coordinator_url,
            node_id,
            hostname,
            region,
            exclude_interfaces,
            allowed_ips,
            proxy_mode,
            report_interval_secs,
            daemon,
            daemon_binary,
            runtime_dir,
            startup_attempts,
            startup_interval_ms,
            probe_timeout_ms,
            log_level,
        })
    }

    /// Instance manager settings derived from this configuration.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            port_range: self.port_range,
            runtime_dir: self.runtime_dir.clone(),
            startup_attempts: self.startup_attempts,
            startup_interval: Duration::from_millis(self.startup_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Host part of the coordinator URL, without IPv6 brackets.
fn coordinator_host(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.port_range, PortRange::new(10000, 20000).unwrap());
        assert_eq!(config.proxy_mode, AccessMode::Restricted);
        assert_eq!(config.daemon, DaemonKind::Tinyproxy);
        assert_eq!(config.exclude_interfaces, vec!["docker", "veth", "br-"]);
        assert!(config.coordinator_url.is_none());
        assert!(config.allowed_ips.is_empty());
        assert_eq!(config.node_id, config.hostname);
        assert_eq!(config.startup_attempts, 5);
    }

    #[test]
    fn test_restricted_mode_allows_coordinator_host() {
        let config = load(&[("PV6_COORDINATOR_URL", "http://[2001:db8::5]:8081/")]).unwrap();
        assert_eq!(config.coordinator_url.as_deref(), Some("http://[2001:db8::5]:8081"));
        assert_eq!(config.allowed_ips, vec!["2001:db8::5"]);
    }

    #[test]
    fn test_explicit_allow_list_wins() {
        let config = load(&[
            ("PV6_COORDINATOR_URL", "http://10.0.0.1:8081"),
            ("PV6_ALLOWED_IPS", "198.51.100.1, 2001:db8::9"),
        ])
        .unwrap();
        assert_eq!(config.allowed_ips, vec!["198.51.100.1", "2001:db8::9"]);
    }

    #[test]
    fn test_open_mode_keeps_allow_list_empty() {
        let config = load(&[
            ("PV6_COORDINATOR_URL", "http://10.0.0.1:8081"),
            ("PV6_PROXY_MODE", "open"),
        ])
        .unwrap();
        assert_eq!(config.proxy_mode, AccessMode::Open);
        assert!(config.allowed_ips.is_empty());
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = load(&[("PV6_PROXY_PORT_START", "ten")]).unwrap_err();
        assert!(err.to_string().contains("PV6_PROXY_PORT_START"));

        assert!(load(&[("PV6_PROXY_MODE", "closed")]).is_err());
        assert!(load(&[("PV6_DAEMON", "squid")]).is_err());
        assert!(load(&[("PV6_PROXY_PORT_START", "3000"), ("PV6_PROXY_PORT_END", "2000")]).is_err());
    }
}
