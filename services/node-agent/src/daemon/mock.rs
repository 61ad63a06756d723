//! In-process stand-in for the proxy daemon.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{DaemonError, DaemonExit, DaemonHandle, DaemonLauncher, DaemonSpec, ExitSignal};

/// What a mock daemon does once started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Bind the requested address and accept (then drop) connections.
    #[default]
    Listen,
    /// Stay alive without ever listening.
    Unreachable,
    /// Exit with code 1 straight after starting.
    ExitImmediately,
    /// Refuse to start at all.
    FailSpawn,
}

/// Launcher producing [`MockDaemon`]s.
#[derive(Debug, Default)]
pub struct MockLauncher {
    behavior: Mutex<MockBehavior>,
    daemons: Mutex<Vec<Arc<MockDaemon>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            daemons: Mutex::new(Vec::new()),
        }
    }

    /// Change the behavior of daemons started from now on.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Every daemon started so far, in start order.
    pub fn daemons(&self) -> Vec<Arc<MockDaemon>> {
        lock(&self.daemons).clone()
    }

    /// The most recent daemon started for an instance.
    pub fn daemon_for(&self, instance_id: &str) -> Option<Arc<MockDaemon>> {
        lock(&self.daemons)
            .iter()
            .rev()
            .find(|d| d.instance_id == instance_id)
            .cloned()
    }
}

#[async_trait]
impl DaemonLauncher for MockLauncher {
    async fn spawn(&self, spec: &DaemonSpec) -> Result<Arc<dyn DaemonHandle>, DaemonError> {
        let behavior = *lock(&self.behavior);

        let listener = match behavior {
            MockBehavior::FailSpawn => {
                return Err(DaemonError::Spawn("mock launcher refuses to start".into()));
            }
            MockBehavior::Listen => Some(
                TcpListener::bind(spec.bind)
                    .await
                    .map_err(|e| DaemonError::Spawn(format!("bind {}: {e}", spec.bind)))?,
            ),
            MockBehavior::Unreachable | MockBehavior::ExitImmediately => None,
        };

        let (exit_tx, exit) = ExitSignal::new();
        let accept_task = listener.map(|listener| tokio::spawn(accept_loop(listener)));

        let daemon = Arc::new(MockDaemon {
            instance_id: spec.instance_id.clone(),
            bind: spec.bind,
            exit_tx,
            exit,
            accept_task: Mutex::new(accept_task),
        });

        info!(
            instance_id = %spec.instance_id,
            bind = %spec.bind,
            behavior = ?behavior,
            "[MOCK] Started proxy daemon"
        );

        if behavior == MockBehavior::ExitImmediately {
            daemon.finish(DaemonExit::code(1));
        }

        lock(&self.daemons).push(Arc::clone(&daemon));
        Ok(daemon)
    }
}

/// A fake daemon started by [`MockLauncher`].
#[derive(Debug)]
pub struct MockDaemon {
    instance_id: String,
    bind: SocketAddr,
    exit_tx: watch::Sender<Option<DaemonExit>>,
    exit: ExitSignal,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockDaemon {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    /// Simulate the daemon dying on its own.
    pub fn crash(&self, code: i32) {
        self.finish(DaemonExit::code(code));
    }

    fn finish(&self, exit: DaemonExit) {
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        let published = self.exit_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
        if published {
            debug!(instance_id = %self.instance_id, exit = %exit, "[MOCK] Daemon exited");
        }
    }
}

#[async_trait]
impl DaemonHandle for MockDaemon {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_running(&self) -> bool {
        self.exit.exited().is_none()
    }

    fn terminate(&self) -> Result<(), DaemonError> {
        self.finish(DaemonExit::signal(15));
        Ok(())
    }

    async fn wait(&self) -> DaemonExit {
        self.exit.wait().await
    }
}

async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => drop(stream),
            Err(e) => {
                debug!(error = %e, "[MOCK] Accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonFiles;
    use tokio::net::TcpStream;

    fn spec(bind: &str) -> DaemonSpec {
        DaemonSpec {
            instance_id: format!("mock-{bind}"),
            bind: bind.parse().unwrap(),
            files: DaemonFiles::for_instance(std::path::Path::new("/tmp"), "mock"),
        }
    }

    #[tokio::test]
    async fn test_listening_daemon_accepts_connections() {
        let launcher = MockLauncher::new();
        let handle = launcher.spawn(&spec("127.0.0.1:0")).await.unwrap();
        assert!(handle.is_running());

        let daemon = launcher.daemons().pop().unwrap();
        assert_eq!(daemon.instance_id(), "mock-127.0.0.1:0");
        handle.terminate().unwrap();
        assert_eq!(handle.wait().await, DaemonExit::signal(15));
    }

    #[tokio::test]
    async fn test_crash_is_observed_by_waiters() {
        let launcher = MockLauncher::new();
        let handle = launcher.spawn(&spec("127.0.0.1:0")).await.unwrap();

        let waiter = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.wait().await }
        });
        launcher.daemon_for("mock-127.0.0.1:0").unwrap().crash(7);

        assert_eq!(waiter.await.unwrap(), DaemonExit::code(7));
        // A later terminate does not overwrite the recorded exit.
        handle.terminate().unwrap();
        assert_eq!(handle.wait().await, DaemonExit::code(7));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_does_not_listen() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let launcher = MockLauncher::with_behavior(MockBehavior::Unreachable);
        let handle = launcher.spawn(&spec(&addr.to_string())).await.unwrap();
        assert!(handle.is_running());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_immediately_and_fail_spawn() {
        let launcher = MockLauncher::with_behavior(MockBehavior::ExitImmediately);
        let handle = launcher.spawn(&spec("127.0.0.1:0")).await.unwrap();
        assert!(!handle.is_running());

        launcher.set_behavior(MockBehavior::FailSpawn);
        assert!(launcher.spawn(&spec("127.0.0.1:0")).await.is_err());
        assert_eq!(launcher.daemons().len(), 1);
    }
}
