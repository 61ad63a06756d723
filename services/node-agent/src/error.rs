//! Instance manager errors.

use std::path::PathBuf;

use pv6_models::ProxyInstance;
use thiserror::Error;

use crate::daemon::DaemonError;

/// Failures returned by [`crate::ProxyManager`] operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Every port in the configured range is held by an instance.
    #[error("no free port in range {low}-{high}")]
    PortExhausted { low: u16, high: u16 },

    /// The daemon configuration file could not be written.
    #[error("failed to write daemon config {}: {source}", path.display())]
    ConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The daemon process could not be started.
    #[error("failed to spawn proxy daemon: {0}")]
    ProcessSpawnFailed(#[source] DaemonError),

    /// The daemon started but never became reachable. The instance is left in
    /// `Error` status and returned for inspection.
    #[error("proxy {} failed startup verification: {reason}", instance.id)]
    StartupVerificationFailed {
        instance: Box<ProxyInstance>,
        reason: String,
    },

    /// No instance with this id exists.
    #[error("unknown proxy instance: {0}")]
    UnknownInstance(String),
}

impl ManagerError {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            ManagerError::PortExhausted { .. } => "port_exhausted",
            ManagerError::ConfigWriteFailed { .. } => "config_write_failed",
            ManagerError::ProcessSpawnFailed(_) => "process_spawn_failed",
            ManagerError::StartupVerificationFailed { .. } => "startup_verification_failed",
            ManagerError::UnknownInstance(_) => "unknown_instance",
        }
    }

    /// The Error-status instance left behind by a failed start, if any.
    pub fn instance(&self) -> Option<&ProxyInstance> {
        match self {
            ManagerError::StartupVerificationFailed { instance, .. } => Some(instance.as_ref()),
            _ => None,
        }
    }
}
