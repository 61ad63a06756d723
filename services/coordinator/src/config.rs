use std::net::{Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Registry API listen address.
    pub listen_addr: SocketAddr,
    /// Ingress proxy listen address.
    pub proxy_listen_addr: SocketAddr,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Reports older than this are evicted.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr =
            parse_or(&lookup, "PV6_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8081)))?;
        let proxy_listen_addr = parse_or(
            &lookup,
            "PV6_PROXY_LISTEN_ADDR",
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 8888)),
        )?;
        let health_interval_secs = parse_or(&lookup, "PV6_HEALTH_INTERVAL_SECS", 30u64)?;
        let health_timeout_ms = parse_or(&lookup, "PV6_HEALTH_TIMEOUT_MS", 5000u64)?;
        let stale_after_secs = parse_or(&lookup, "PV6_STALE_AFTER_SECS", 120u64)?;
        let sweep_interval_secs = parse_or(&lookup, "PV6_SWEEP_INTERVAL_SECS", 60u64)?;
        let max_connections = parse_or(&lookup, "PV6_MAX_CONNECTIONS", 10000usize)?;
        let log_level = lookup("PV6_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            proxy_listen_addr,
            // tokio intervals must be non-zero.
            health_interval: Duration::from_secs(health_interval_secs.max(1)),
            health_timeout: Duration::from_millis(health_timeout_ms),
            stale_after: Duration::from_secs(stale_after_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            max_connections: max_connections.max(1),
            log_level,
        })
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        Config::from_lookup(|key| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8081");
        assert_eq!(config.proxy_listen_addr.to_string(), "[::]:8888");
        assert_eq!(config.health_interval, Duration::from_secs(30));
        assert_eq!(config.health_timeout, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.max_connections, 10000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PV6_PROXY_LISTEN_ADDR", "127.0.0.1:3128"),
            ("PV6_STALE_AFTER_SECS", "300"),
            ("PV6_SWEEP_INTERVAL_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.proxy_listen_addr.port(), 3128);
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("PV6_HEALTH_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("PV6_HEALTH_TIMEOUT_MS"));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = load(&[("PV6_LISTEN_ADDR", "  "), ("PV6_MAX_CONNECTIONS", "")]).unwrap();
        assert_eq!(config.listen_addr.port(), 8081);
        assert_eq!(config.max_connections, 10000);
    }
}
