//! Proxy daemon adapter.
//!
//! The instance manager never touches processes directly. It asks a
//! [`DaemonLauncher`] to start a daemon for a [`DaemonSpec`] and receives a
//! [`DaemonHandle`] it can poll, wait on, and terminate.
//!
//! Two launchers exist:
//! - [`TinyproxyLauncher`] runs the real executable under `tokio::process`
//! - [`MockLauncher`] listens on the bind address in-process, for tests and
//!   development hosts without the daemon installed

mod config;
mod mock;
mod tinyproxy;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

pub use config::{render_config, AccessControl, DaemonFiles};
pub use mock::{MockBehavior, MockDaemon, MockLauncher};
pub use tinyproxy::TinyproxyLauncher;

/// Daemon adapter errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// A signal could not be delivered.
    #[error("signal failed: {0}")]
    Signal(String),
}

/// Everything a launcher needs to start one daemon.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub instance_id: String,
    /// Address and port the daemon must listen on.
    pub bind: SocketAddr,
    pub files: DaemonFiles,
}

/// How a daemon process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed.
    pub signal: Option<i32>,
}

impl DaemonExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for DaemonExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Starts daemons.
#[async_trait]
pub trait DaemonLauncher: Send + Sync {
    /// Start a daemon for the given spec. The config file named in the spec has
    /// already been written.
    async fn spawn(&self, spec: &DaemonSpec) -> Result<Arc<dyn DaemonHandle>, DaemonError>;
}

/// A started daemon.
#[async_trait]
pub trait DaemonHandle: Send + Sync {
    /// OS process id, if there is a real process.
    fn pid(&self) -> Option<u32>;

    /// Whether the daemon has not exited yet.
    fn is_running(&self) -> bool;

    /// Ask the daemon to exit. A daemon that already exited is not an error.
    fn terminate(&self) -> Result<(), DaemonError>;

    /// Block until the daemon exits. Any number of callers may wait.
    async fn wait(&self) -> DaemonExit;
}

/// Exit status published once by whoever reaps the daemon.
///
/// Shared by both launchers so `wait` and `is_running` behave the same.
#[derive(Debug, Clone)]
pub(crate) struct ExitSignal {
    rx: watch::Receiver<Option<DaemonExit>>,
}

impl ExitSignal {
    pub(crate) fn new() -> (watch::Sender<Option<DaemonExit>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    pub(crate) fn exited(&self) -> Option<DaemonExit> {
        *self.rx.borrow()
    }

    pub(crate) async fn wait(&self) -> DaemonExit {
        let mut rx = self.rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(DaemonExit::unknown),
            // Reaper dropped without publishing.
            Err(_) => DaemonExit::unknown(),
        };
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        assert_eq!(DaemonExit::code(1).to_string(), "exit code 1");
        assert_eq!(DaemonExit::signal(15).to_string(), "signal 15");
        assert_eq!(DaemonExit::unknown().to_string(), "unknown exit status");
    }

    #[tokio::test]
    async fn test_exit_signal_wakes_every_waiter() {
        let (tx, signal) = ExitSignal::new();
        assert!(signal.exited().is_none());

        let first = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        let second = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        tx.send_replace(Some(DaemonExit::code(3)));

        assert_eq!(first.await.unwrap(), DaemonExit::code(3));
        assert_eq!(second.await.unwrap(), DaemonExit::code(3));
        assert_eq!(signal.exited(), Some(DaemonExit::code(3)));
    }

    #[tokio::test]
    async fn test_dropped_reaper_reports_unknown() {
        let (tx, signal) = ExitSignal::new();
        drop(tx);
        assert_eq!(signal.wait().await, DaemonExit::unknown());
    }
}
