//! Proxy instance manager.
//!
//! Owns every proxy daemon on this host: allocates ports, writes daemon
//! configuration, spawns daemons through a [`DaemonLauncher`], verifies that
//! they come up, and watches them for unexpected exits.
//!
//! ## Locking
//!
//! One `RwLock` guards the instance table, the process table and the port
//! cursor. Allocation, config write, spawn and table insertion happen under a
//! single write guard. Startup verification runs without the lock; promotion
//! and demotion re-take it.
//!
//! ## Port ownership
//!
//! A port is held by any instance that is `Starting`, `Running` or `Error`.
//! Only an explicit stop releases it. Crashed instances therefore keep their
//! port until someone stops them.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pv6_models::{instance_id, Ipv6Address, ProxyInstance, ProxyMetrics, ProxyStatus};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::daemon::{
    render_config, AccessControl, DaemonFiles, DaemonHandle, DaemonLauncher, DaemonSpec,
};
use crate::error::ManagerError;

/// Lines of daemon log shown when startup fails.
const LOG_TAIL_LINES: usize = 20;

/// Inclusive range of ports handed out to daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    /// `None` unless `0 < low <= high`.
    pub fn new(low: u16, high: u16) -> Option<Self> {
        (low > 0 && low <= high).then_some(Self { low, high })
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

/// Tunables for [`ProxyManager`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub port_range: PortRange,
    /// Where config, log and pid files are written.
    pub runtime_dir: PathBuf,
    /// Startup verification attempts before giving up.
    pub startup_attempts: u32,
    /// Sleep before each verification attempt.
    pub startup_interval: Duration,
    /// Timeout of each verification connect.
    pub probe_timeout: Duration,
}

/// A live daemon and the spawn it belongs to.
///
/// The generation tells a watcher whether the entry it was registered for is
/// still the current one.
struct ProcessEntry {
    generation: u64,
    handle: Arc<dyn DaemonHandle>,
}

struct ManagerState {
    instances: HashMap<String, ProxyInstance>,
    processes: HashMap<String, ProcessEntry>,
    cursor: u16,
    access: AccessControl,
    next_generation: u64,
}

impl ManagerState {
    fn new(range: PortRange) -> Self {
        Self {
            instances: HashMap::new(),
            processes: HashMap::new(),
            cursor: range.low,
            access: AccessControl::default(),
            next_generation: 0,
        }
    }

    /// Pick the next free port, scanning cursor..=high then low..cursor.
    fn next_port(&mut self, range: PortRange) -> Result<u16, ManagerError> {
        let held: HashSet<u16> = self
            .instances
            .values()
            .filter(|i| i.status.holds_port())
            .map(|i| i.port)
            .collect();

        let cursor = self.cursor.clamp(range.low, range.high);
        let port = (cursor..=range.high)
            .chain(range.low..cursor)
            .find(|port| !held.contains(port))
            .ok_or(ManagerError::PortExhausted {
                low: range.low,
                high: range.high,
            })?;

        self.cursor = if port == range.high {
            range.low
        } else {
            port + 1
        };
        Ok(port)
    }

    /// Whether `id` is still backed by the spawn with this generation.
    fn owns(&self, id: &str, generation: u64) -> bool {
        self.processes
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }
}

/// Manages the proxy daemons on this host.
pub struct ProxyManager {
    settings: ManagerSettings,
    launcher: Arc<dyn DaemonLauncher>,
    state: Arc<RwLock<ManagerState>>,
}

impl ProxyManager {
    pub fn new(settings: ManagerSettings, launcher: Arc<dyn DaemonLauncher>) -> Self {
        let state = ManagerState::new(settings.port_range);
        Self {
            settings,
            launcher,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Replace the access policy used for daemons started from now on.
    pub async fn set_access_control(&self, access: AccessControl) {
        info!(
            mode = %access.mode,
            allowed_ips = ?access.allowed_ips,
            "Access control updated"
        );
        self.state.write().await.access = access;
    }

    /// Start a daemon bound to `address` and wait until it is reachable.
    ///
    /// On a verification failure the instance stays in the table with status
    /// `Error` and is returned inside the error.
    pub async fn start_proxy(&self, address: Ipv6Address) -> Result<ProxyInstance, ManagerError> {
        let (instance, files, handle, generation) = {
            let mut state = self.state.write().await;

            let cursor = state.cursor;
            let port = state.next_port(self.settings.port_range)?;
            let id = instance_id(&address.ip, port);
            let files = DaemonFiles::for_instance(&self.settings.runtime_dir, &id);

            let contents = render_config(&address.ip, port, &state.access, &files);
            if let Err(source) = tokio::fs::write(&files.config, contents).await {
                state.cursor = cursor;
                discard_config(&files).await;
                return Err(ManagerError::ConfigWriteFailed {
                    path: files.config.clone(),
                    source,
                });
            }
            debug!(instance_id = %id, config = %files.config.display(), "Wrote daemon config");

            let instance = ProxyInstance::starting(address, port);
            let spec = DaemonSpec {
                instance_id: id.clone(),
                bind: instance.socket_addr(),
                files: files.clone(),
            };
            let handle = match self.launcher.spawn(&spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(instance_id = %id, error = %e, "Failed to spawn proxy daemon");
                    state.cursor = cursor;
                    discard_config(&files).await;
                    return Err(ManagerError::ProcessSpawnFailed(e));
                }
            };

            state.next_generation += 1;
            let generation = state.next_generation;
            state.instances.insert(id.clone(), instance.clone());
            state.processes.insert(
                id,
                ProcessEntry {
                    generation,
                    handle: Arc::clone(&handle),
                },
            );

            (instance, files, handle, generation)
        };

        info!(
            instance_id = %instance.id,
            port = instance.port,
            pid = ?handle.pid(),
            "Proxy daemon started, verifying"
        );
        self.spawn_watcher(instance.id.clone(), generation, Arc::clone(&handle));

        match self.verify_startup(instance.socket_addr(), handle.as_ref()).await {
            Ok(()) => self.promote(&instance.id, generation).await,
            Err(reason) => {
                log_tail(&instance.id, &files.log).await;
                self.fail_startup(&instance.id, generation, reason).await
            }
        }
    }

    /// Probe the daemon until it accepts a TCP connection.
    async fn verify_startup(
        &self,
        addr: SocketAddr,
        handle: &dyn DaemonHandle,
    ) -> Result<(), String> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.settings.startup_attempts {
            tokio::time::sleep(self.settings.startup_interval).await;

            if !handle.is_running() {
                let exit = handle.wait().await;
                return Err(format!("daemon exited during startup ({exit})"));
            }

            match tokio::time::timeout(self.settings.probe_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            debug!(%addr, attempt, error = %last_error, "Startup probe failed");
        }

        Err(format!(
            "not reachable on {addr} after {} attempts: {last_error}",
            self.settings.startup_attempts
        ))
    }

    async fn promote(&self, id: &str, generation: u64) -> Result<ProxyInstance, ManagerError> {
        let mut state = self.state.write().await;
        let owned = state.owns(id, generation);

        let Some(instance) = state.instances.get_mut(id) else {
            return Err(ManagerError::UnknownInstance(id.to_string()));
        };
        if !owned || instance.status != ProxyStatus::Starting {
            // Stopped while we were probing.
            return Err(ManagerError::StartupVerificationFailed {
                instance: Box::new(instance.clone()),
                reason: format!("instance became {} during startup", instance.status),
            });
        }

        instance.status = ProxyStatus::Running;
        instance.last_checked = Utc::now();
        info!(instance_id = %id, port = instance.port, "Proxy running");
        Ok(instance.clone())
    }

    async fn fail_startup(
        &self,
        id: &str,
        generation: u64,
        reason: String,
    ) -> Result<ProxyInstance, ManagerError> {
        let mut state = self.state.write().await;

        if state.owns(id, generation) {
            if let Some(entry) = state.processes.remove(id) {
                if let Err(e) = entry.handle.terminate() {
                    warn!(instance_id = %id, error = %e, "Failed to terminate unverified daemon");
                }
            }
        }

        let Some(instance) = state.instances.get_mut(id) else {
            return Err(ManagerError::UnknownInstance(id.to_string()));
        };
        if instance.status == ProxyStatus::Starting {
            instance.status = ProxyStatus::Error;
            instance.last_checked = Utc::now();
        }

        error!(instance_id = %id, reason = %reason, "Proxy failed startup verification");
        Err(ManagerError::StartupVerificationFailed {
            instance: Box::new(instance.clone()),
            reason,
        })
    }

    /// Demote a running instance to `Error` once its daemon exits.
    fn spawn_watcher(&self, id: String, generation: u64, handle: Arc<dyn DaemonHandle>) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let exit = handle.wait().await;

            let mut state = state.write().await;
            if !state.owns(&id, generation) {
                // Stopped, failed verification, or replaced.
                debug!(instance_id = %id, exit = %exit, "Daemon exit already handled");
                return;
            }
            state.processes.remove(&id);

            if let Some(instance) = state.instances.get_mut(&id) {
                if instance.status == ProxyStatus::Running {
                    instance.status = ProxyStatus::Error;
                    instance.last_checked = Utc::now();
                    warn!(instance_id = %id, exit = %exit, "Proxy daemon exited unexpectedly");
                }
            }
        });
    }

    /// Terminate an instance's daemon and mark it `Stopped`.
    pub async fn stop_proxy(&self, id: &str) -> Result<ProxyInstance, ManagerError> {
        let mut state = self.state.write().await;
        if !state.instances.contains_key(id) {
            return Err(ManagerError::UnknownInstance(id.to_string()));
        }

        if let Some(entry) = state.processes.remove(id) {
            if let Err(e) = entry.handle.terminate() {
                warn!(instance_id = %id, error = %e, "Failed to signal proxy daemon");
            }
        }

        let Some(instance) = state.instances.get_mut(id) else {
            return Err(ManagerError::UnknownInstance(id.to_string()));
        };
        instance.status = ProxyStatus::Stopped;
        instance.last_checked = Utc::now();
        info!(instance_id = %id, port = instance.port, "Proxy stopped");
        Ok(instance.clone())
    }

    /// Snapshot of every known instance, ordered by port.
    pub async fn get_instances(&self) -> Vec<ProxyInstance> {
        let state = self.state.read().await;
        let mut instances: Vec<ProxyInstance> = state.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    /// Replace an instance's metrics and refresh its check time.
    pub async fn update_metrics(
        &self,
        id: &str,
        metrics: ProxyMetrics,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.write().await;
        let instance = state
            .instances
            .get_mut(id)
            .ok_or_else(|| ManagerError::UnknownInstance(id.to_string()))?;
        instance.metrics = metrics;
        instance.last_checked = Utc::now();
        Ok(())
    }

    /// Stop every instance that still has a daemon. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.write().await;
        let processes: Vec<(String, ProcessEntry)> = state.processes.drain().collect();

        for (id, entry) in &processes {
            if let Err(e) = entry.handle.terminate() {
                warn!(instance_id = %id, error = %e, "Failed to signal proxy daemon");
            }
            if let Some(instance) = state.instances.get_mut(id) {
                instance.status = ProxyStatus::Stopped;
                instance.last_checked = Utc::now();
            }
        }

        info!(stopped = processes.len(), "All proxies stopped");
        processes.len()
    }
}

/// Remove a config file written for a daemon that never started.
async fn discard_config(files: &DaemonFiles) {
    match tokio::fs::remove_file(&files.config).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(config = %files.config.display(), error = %e, "Failed to remove daemon config");
        }
    }
}

/// Log the last lines of a daemon's log file, if there is one.
async fn log_tail(instance_id: &str, path: &Path) {
    let Ok(contents) = tokio::fs::read_to_string(path).await else {
        return;
    };
    let lines: Vec<&str> = contents.lines().collect();
    let tail = lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n");
    if !tail.is_empty() {
        warn!(instance_id = %instance_id, log = %path.display(), "Daemon log tail:\n{tail}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(range: PortRange, held: &[(u16, ProxyStatus)]) -> ManagerState {
        let mut state = ManagerState::new(range);
        for (i, (port, status)) in held.iter().enumerate() {
            let ip = format!("2001:db8::{}", i + 1).parse().unwrap();
            let mut instance = ProxyInstance::starting(Ipv6Address::new(ip, "eth0", true), *port);
            instance.status = *status;
            state.instances.insert(instance.id.clone(), instance);
        }
        state
    }

    #[test]
    fn test_port_range_validation() {
        assert!(PortRange::new(0, 10).is_none());
        assert!(PortRange::new(20, 10).is_none());
        let range = PortRange::new(10, 10).unwrap();
        assert!(range.contains(10));
        assert!(!range.contains(11));
    }

    #[test]
    fn test_allocation_walks_range_in_order() {
        let range = PortRange::new(10000, 10002).unwrap();
        let mut state = state_with(range, &[]);
        assert_eq!(state.next_port(range).unwrap(), 10000);
        assert_eq!(state.next_port(range).unwrap(), 10001);
        assert_eq!(state.next_port(range).unwrap(), 10002);
        // Nothing holds a port in this table, so the cursor wraps.
        assert_eq!(state.next_port(range).unwrap(), 10000);
    }

    #[test]
    fn test_allocation_skips_starting_running_and_error() {
        let range = PortRange::new(10000, 10003).unwrap();
        let mut state = state_with(
            range,
            &[
                (10000, ProxyStatus::Starting),
                (10001, ProxyStatus::Running),
                (10002, ProxyStatus::Error),
            ],
        );
        assert_eq!(state.next_port(range).unwrap(), 10003);
    }

    #[test]
    fn test_allocation_reuses_stopped_port_after_wrap() {
        let range = PortRange::new(10000, 10002).unwrap();
        let mut state = state_with(
            range,
            &[
                (10000, ProxyStatus::Stopped),
                (10001, ProxyStatus::Running),
                (10002, ProxyStatus::Running),
            ],
        );
        state.cursor = 10001;
        assert_eq!(state.next_port(range).unwrap(), 10000);
        assert_eq!(state.cursor, 10001);
    }

    #[test]
    fn test_allocation_exhausted() {
        let range = PortRange::new(10000, 10001).unwrap();
        let mut state = state_with(
            range,
            &[(10000, ProxyStatus::Running), (10001, ProxyStatus::Error)],
        );
        assert!(matches!(
            state.next_port(range),
            Err(ManagerError::PortExhausted {
                low: 10000,
                high: 10001
            })
        ));
    }
}
