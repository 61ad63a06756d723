//! Launcher for the real `tinyproxy` executable.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{DaemonError, DaemonExit, DaemonHandle, DaemonLauncher, DaemonSpec, ExitSignal};

/// Runs `tinyproxy -d -c <config>` in the foreground.
#[derive(Debug, Clone)]
pub struct TinyproxyLauncher {
    binary: PathBuf,
}

impl TinyproxyLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl DaemonLauncher for TinyproxyLauncher {
    async fn spawn(&self, spec: &DaemonSpec) -> Result<Arc<dyn DaemonHandle>, DaemonError> {
        let mut child = Command::new(&self.binary)
            .arg("-d")
            .arg("-c")
            .arg(&spec.files.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the reaper task (runtime shutdown) takes the daemon down with it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let pid = child.id();
        info!(
            instance_id = %spec.instance_id,
            pid = ?pid,
            config = %spec.files.config.display(),
            "Spawned tinyproxy"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(spec.instance_id.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(spec.instance_id.clone(), "stderr", stderr));
        }

        let (exit_tx, exit) = ExitSignal::new();
        let instance_id = spec.instance_id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Failed to wait on tinyproxy");
                    DaemonExit::unknown()
                }
            };
            debug!(instance_id = %instance_id, exit = %exit, "tinyproxy reaped");
            exit_tx.send_replace(Some(exit));
        });

        Ok(Arc::new(TinyproxyProcess { pid, exit }))
    }
}

/// A running `tinyproxy` child.
struct TinyproxyProcess {
    pid: Option<u32>,
    exit: ExitSignal,
}

#[async_trait]
impl DaemonHandle for TinyproxyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.exit.exited().is_none()
    }

    fn terminate(&self) -> Result<(), DaemonError> {
        if !self.is_running() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|_| DaemonError::Signal(format!("bad pid {pid}")))?;

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DaemonError::Signal(format!("SIGTERM to {pid}: {e}"))),
        }
    }

    async fn wait(&self) -> DaemonExit {
        self.exit.wait().await
    }
}

fn exit_from_status(status: ExitStatus) -> DaemonExit {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => DaemonExit::code(code),
        (None, Some(signal)) => DaemonExit::signal(signal),
        (None, None) => DaemonExit::unknown(),
    }
}

/// Forward daemon output lines into the log.
async fn relay_output<R>(instance_id: String, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stream == "stderr" => {
                warn!(instance_id = %instance_id, stream, "{line}");
            }
            Ok(Some(line)) => {
                info!(instance_id = %instance_id, stream, "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(instance_id = %instance_id, stream, error = %e, "Output relay stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonFiles;

    fn spec(dir: &std::path::Path) -> DaemonSpec {
        DaemonSpec {
            instance_id: "2001:db8::1-10000".to_string(),
            bind: "[2001:db8::1]:10000".parse().unwrap(),
            files: DaemonFiles::for_instance(dir, "2001:db8::1-10000"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TinyproxyLauncher::new(dir.path().join("no-such-tinyproxy"));

        let result = launcher.spawn(&spec(dir.path())).await;
        assert!(matches!(result, Err(DaemonError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        // `true` ignores its arguments and exits 0 straight away.
        let dir = tempfile::tempdir().unwrap();
        let launcher = TinyproxyLauncher::new("true");

        let handle = launcher.spawn(&spec(dir.path())).await.unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.wait().await, DaemonExit::code(0));
        assert!(!handle.is_running());
        handle.terminate().unwrap();
    }
}
