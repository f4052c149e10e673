//! OS process implementation of [`ProxyRunner`].
//!
//! Spawns one proxy process per epoch with
//! `<binary> --bootstrap <path> --epoch <n>`, delivers SIGTERM as the drain
//! signal, and reaps children by polling `try_wait` so that `wait` stays
//! cancel-safe (no child ownership ever moves into a cancellable future).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{Epoch, ExitInfo};
use crate::runner::{LaunchSpec, ProxyRunner, ReadyError, SpawnError};

/// Interval between exit/readiness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ChildEntry {
    child: Child,
    ready_probe: Option<SocketAddr>,
}

/// Proxy runner backed by real OS processes.
pub struct OsProxyRunner {
    binary: PathBuf,
    children: Mutex<HashMap<Epoch, ChildEntry>>,
}

impl OsProxyRunner {
    /// Create a runner that spawns the given proxy binary.
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Poll for process exit without blocking. Reaps and forgets the child
    /// once it has terminated.
    fn poll_exit(&self, epoch: Epoch) -> Option<ExitInfo> {
        let mut children = self.children.lock().unwrap();
        let entry = children.get_mut(&epoch)?;

        match entry.child.try_wait() {
            Ok(Some(status)) => {
                children.remove(&epoch);
                Some(ExitInfo {
                    code: status.code(),
                    forced: false,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(epoch = %epoch, error = %e, "Failed to poll proxy process");
                children.remove(&epoch);
                Some(ExitInfo::killed())
            }
        }
    }

    fn probe_addr(&self, epoch: Epoch) -> Option<SocketAddr> {
        self.children
            .lock()
            .unwrap()
            .get(&epoch)
            .and_then(|e| e.ready_probe)
    }
}

#[async_trait]
impl ProxyRunner for OsProxyRunner {
    async fn start(&self, launch: &LaunchSpec) -> Result<(), SpawnError> {
        let child = Command::new(&self.binary)
            .arg("--bootstrap")
            .arg(&launch.bootstrap_path)
            .arg("--epoch")
            .arg(launch.epoch.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SpawnError {
                epoch: launch.epoch,
                source,
            })?;

        debug!(
            epoch = %launch.epoch,
            pid = child.id(),
            bootstrap = %launch.bootstrap_path.display(),
            "Spawned proxy process"
        );

        self.children.lock().unwrap().insert(
            launch.epoch,
            ChildEntry {
                child,
                ready_probe: launch.ready_probe,
            },
        );
        Ok(())
    }

    async fn await_ready(&self, epoch: Epoch, deadline: Duration) -> Result<(), ReadyError> {
        let probe = self.probe_addr(epoch);
        let expires = Instant::now() + deadline;

        loop {
            if let Some(exit) = self.poll_exit(epoch) {
                return Err(ReadyError::Exited(exit));
            }

            match probe {
                // Ready once the proxy accepts on its probe address.
                Some(addr) => {
                    if TcpStream::connect(addr).await.is_ok() {
                        return Ok(());
                    }
                }
                // No probe configured: a surviving process is ready.
                None => return Ok(()),
            }

            if Instant::now() >= expires {
                return Err(ReadyError::TimedOut(deadline));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn signal_drain(&self, epoch: Epoch) {
        let children = self.children.lock().unwrap();
        let Some(entry) = children.get(&epoch) else {
            return;
        };

        match entry.child.id() {
            Some(pid) => {
                // SAFETY: plain kill(2) with a valid pid and signal.
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    warn!(
                        epoch = %epoch,
                        pid,
                        errno = std::io::Error::last_os_error().raw_os_error(),
                        "Failed to deliver drain signal"
                    );
                }
            }
            None => warn!(epoch = %epoch, "Proxy already reaped, cannot drain"),
        }
    }

    fn force_stop(&self, epoch: Epoch) {
        let mut children = self.children.lock().unwrap();
        if let Some(entry) = children.get_mut(&epoch) {
            if let Err(e) = entry.child.start_kill() {
                warn!(epoch = %epoch, error = %e, "Failed to kill proxy process");
            }
        }
    }

    async fn wait(&self, epoch: Epoch) -> ExitInfo {
        loop {
            if let Some(exit) = self.poll_exit(epoch) {
                return exit;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn launch(epoch: u64) -> LaunchSpec {
        LaunchSpec {
            epoch: Epoch(epoch),
            bootstrap_path: PathBuf::from("/dev/null"),
            ready_probe: None,
        }
    }

    /// A stand-in proxy that ignores its arguments and sleeps until
    /// signaled.
    fn sleeper_binary(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("fake-proxy");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"#!/bin/sh\nexec sleep 30\n").unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let runner = OsProxyRunner::new(PathBuf::from("/nonexistent/proxy"));
        let err = runner.start(&launch(1)).await.unwrap_err();
        assert_eq!(err.epoch, Epoch(1));
    }

    #[tokio::test]
    async fn test_drain_signal_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OsProxyRunner::new(sleeper_binary(dir.path()));

        runner.start(&launch(1)).await.unwrap();
        runner
            .await_ready(Epoch(1), Duration::from_secs(5))
            .await
            .unwrap();

        runner.signal_drain(Epoch(1));
        let exit = tokio::time::timeout(Duration::from_secs(5), runner.wait(Epoch(1)))
            .await
            .expect("process should exit after SIGTERM");

        // Killed by signal: no exit code.
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn test_force_stop_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OsProxyRunner::new(sleeper_binary(dir.path()));

        runner.start(&launch(2)).await.unwrap();
        runner.force_stop(Epoch(2));

        let exit = tokio::time::timeout(Duration::from_secs(5), runner.wait(Epoch(2)))
            .await
            .expect("process should exit after SIGKILL");
        assert_eq!(exit.code, None);
    }
}
