//! Address discovery for the proxy agent.
//!
//! This library provides:
//! - IPv6 prefix matching
//! - Public/private classification of IPv6 addresses
//! - Interface enumeration and filtering down to the routable addresses a host
//!   can run proxies on

use std::net::Ipv6Addr;
use std::str::FromStr;

use thiserror::Error;

mod scan;

pub use scan::{enumerate_interfaces, scan_addresses, AddressScanner, InterfaceInfo};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// The platform could not list network interfaces at all.
    #[error("failed to enumerate network interfaces: {0}")]
    InterfaceEnumeration(String),
}

// ============================================================================
// Prefixes
// ============================================================================

/// IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    const fn from_segments(first: u16, prefix_len: u8) -> Self {
        Self {
            address: Ipv6Addr::new(first, 0, 0, 0, 0, 0, 0, 0),
            prefix_len,
        }
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix_len))
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Classification
// ============================================================================

/// Unique-local addresses, `fc00::/7`.
pub const UNIQUE_LOCAL: Ipv6Prefix = Ipv6Prefix::from_segments(0xfc00, 7);

/// Link-local unicast, `fe80::/10`.
pub const LINK_LOCAL: Ipv6Prefix = Ipv6Prefix::from_segments(0xfe80, 10);

/// Deprecated site-local, `fec0::/10`.
pub const SITE_LOCAL: Ipv6Prefix = Ipv6Prefix::from_segments(0xfec0, 10);

/// Link-local multicast (`ff02::/16` and every flag variant `ffX2::/16`).
fn is_link_local_multicast(addr: &Ipv6Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0xff && octets[1] & 0x0f == 0x02
}

/// Whether an IPv6 address is globally routable.
///
/// Loopback, link-local unicast and multicast, unique-local and site-local
/// addresses are not. Everything else is.
pub fn is_public_ipv6(addr: &Ipv6Addr) -> bool {
    if addr.is_loopback() || is_link_local_multicast(addr) {
        return false;
    }

    ![UNIQUE_LOCAL, LINK_LOCAL, SITE_LOCAL]
        .iter()
        .any(|prefix| prefix.contains(*addr))
}
