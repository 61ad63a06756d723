//! Daemon configuration files.

use std::fmt::Write;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use pv6_models::AccessMode;

/// Who may connect to newly started daemons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControl {
    pub mode: AccessMode,
    /// Extra source addresses allowed in restricted mode.
    pub allowed_ips: Vec<String>,
}

impl AccessControl {
    pub fn new(mode: AccessMode, allowed_ips: Vec<String>) -> Self {
        Self { mode, allowed_ips }
    }
}

/// Paths of the files belonging to one daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonFiles {
    pub config: PathBuf,
    pub log: PathBuf,
    pub pid: PathBuf,
}

impl DaemonFiles {
    /// File paths for an instance, keyed by its id so daemons never share one.
    pub fn for_instance(dir: &Path, instance_id: &str) -> Self {
        Self {
            config: dir.join(format!("tinyproxy-{instance_id}.conf")),
            log: dir.join(format!("tinyproxy-{instance_id}.log")),
            pid: dir.join(format!("tinyproxy-{instance_id}.pid")),
        }
    }
}

const CONNECT_PORTS: [u16; 7] = [443, 563, 993, 995, 80, 8080, 8443];

/// Render the daemon configuration for one instance.
pub fn render_config(
    bind_ip: &Ipv6Addr,
    port: u16,
    acl: &AccessControl,
    files: &DaemonFiles,
) -> String {
    let listen = bind_ip.to_canonical();

    let mut allow = String::new();
    // Loopback and the bind address itself so local probes get through.
    allow.push_str("Allow 127.0.0.1\n");
    allow.push_str("Allow ::1\n");
    let _ = writeln!(allow, "Allow {listen}");
    match acl.mode {
        AccessMode::Restricted => {
            for ip in &acl.allowed_ips {
                let _ = writeln!(allow, "Allow {ip}");
            }
        }
        AccessMode::Open => {
            allow.push_str("Allow 0.0.0.0/0\n");
            allow.push_str("Allow ::/0\n");
        }
    }

    let mut connect = String::new();
    for p in CONNECT_PORTS {
        let _ = writeln!(connect, "ConnectPort {p}");
    }

    format!(
        "# Basic Configuration
Port {port}
Listen {listen}

# Server Configuration
MaxClients 100
MinSpareServers 5
MaxSpareServers 20
StartServers 10
MaxRequestsPerChild 10000

# Access Control
{allow}
# Logging
LogLevel Info
LogFile \"{log}\"
PidFile \"{pid}\"

# Proxy Configuration
ViaProxyName \"proxy-v6\"
DisableViaHeader No
Timeout 600

# Allowed CONNECT targets
{connect}",
        log = files.log.display(),
        pid = files.pid.display(),
    )
}
