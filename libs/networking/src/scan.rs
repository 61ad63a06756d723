//! Interface enumeration and public address discovery.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use pv6_models::Ipv6Address;
use tracing::{debug, info, warn};

use crate::{is_public_ipv6, NetworkError};

/// A network interface and the addresses bound to it.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    /// Bound addresses, or the reason they could not be read.
    pub addrs: Result<Vec<IpAddr>, String>,
}

/// List the host's interfaces in kernel enumeration order.
pub fn enumerate_interfaces() -> Result<Vec<InterfaceInfo>, NetworkError> {
    let entries =
        getifaddrs().map_err(|e| NetworkError::InterfaceEnumeration(e.to_string()))?;

    let mut interfaces: Vec<InterfaceInfo> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        let slot = *index.entry(entry.interface_name.clone()).or_insert_with(|| {
            interfaces.push(InterfaceInfo {
                name: entry.interface_name.clone(),
                up: entry.flags.contains(InterfaceFlags::IFF_UP),
                loopback: entry.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                addrs: Ok(Vec::new()),
            });
            interfaces.len() - 1
        });

        let Some(storage) = entry.address else {
            continue;
        };

        let addr = if let Some(v6) = storage.as_sockaddr_in6() {
            IpAddr::V6(Ipv6Addr::from(v6.ip()))
        } else if let Some(v4) = storage.as_sockaddr_in() {
            IpAddr::V4(Ipv4Addr::from(v4.ip()))
        } else {
            // Link-layer and other families carry no IP address.
            continue;
        };

        if let Ok(addrs) = interfaces[slot].addrs.as_mut() {
            addrs.push(addr);
        }
    }

    Ok(interfaces)
}

/// Filters interfaces and keeps their publicly routable IPv6 addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressScanner {
    exclude_interfaces: Vec<String>,
}

impl AddressScanner {
    /// Create a scanner that skips interfaces whose name contains any of the
    /// given fragments.
    pub fn new(exclude_interfaces: Vec<String>) -> Self {
        Self { exclude_interfaces }
    }

    /// Enumerate the live interfaces and return their public IPv6 addresses.
    pub fn scan(&self) -> Result<Vec<Ipv6Address>, NetworkError> {
        let interfaces = enumerate_interfaces()?;
        Ok(scan_addresses(&interfaces, &self.exclude_interfaces))
    }

    /// Whether the scanner would consider this interface at all.
    pub fn accepts(&self, iface: &InterfaceInfo) -> bool {
        !skip_interface(iface, &self.exclude_interfaces)
    }
}

fn skip_interface(iface: &InterfaceInfo, exclude: &[String]) -> bool {
    if !iface.up || iface.loopback {
        return true;
    }

    exclude
        .iter()
        .any(|fragment| !fragment.is_empty() && iface.name.contains(fragment.as_str()))
}

/// Pick the public IPv6 addresses out of an interface listing.
///
/// Output follows interface order. An address bound to two interfaces is
/// reported twice.
pub fn scan_addresses(interfaces: &[InterfaceInfo], exclude: &[String]) -> Vec<Ipv6Address> {
    let mut found = Vec::new();

    for iface in interfaces {
        if skip_interface(iface, exclude) {
            debug!(interface = %iface.name, "Skipping interface");
            continue;
        }

        let addrs = match &iface.addrs {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(interface = %iface.name, error = %e, "Failed to read interface addresses");
                continue;
            }
        };

        for addr in addrs {
            let IpAddr::V6(ip) = addr else {
                continue;
            };
            if ip.to_ipv4_mapped().is_some() {
                continue;
            }

            if is_public_ipv6(ip) {
                info!(ip = %ip, interface = %iface.name, "Found public IPv6 address");
                found.push(Ipv6Address::new(*ip, iface.name.clone(), true));
            }
        }
    }

    found
}
