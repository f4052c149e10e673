//! Proxy process abstraction.
//!
//! The supervisor never depends on a concrete process API: everything it
//! needs from the child process goes through [`ProxyRunner`]. The OS-backed
//! implementation lives in `process`; [`MockRunner`] provides scripted
//! lifecycles for tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::events::{Epoch, ExitInfo};

/// Everything needed to launch one proxy epoch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub epoch: Epoch,

    /// Rendered bootstrap artifact handed to the process at spawn.
    pub bootstrap_path: PathBuf,

    /// Address probed to decide readiness, if the runner supports probing.
    pub ready_probe: Option<SocketAddr>,
}

/// The proxy process could not be started.
#[derive(Debug, Error)]
#[error("failed to spawn proxy (epoch {epoch}): {source}")]
pub struct SpawnError {
    pub epoch: Epoch,
    #[source]
    pub source: io::Error,
}

/// Why an epoch never became ready.
#[derive(Debug, Error)]
pub enum ReadyError {
    /// The process exited before signaling readiness.
    #[error("process exited before readiness ({0})")]
    Exited(ExitInfo),

    /// The readiness deadline elapsed.
    #[error("readiness deadline ({0:?}) elapsed")]
    TimedOut(Duration),
}

/// Capability for supervising one proxy process per epoch.
///
/// `wait` must be cancel-safe: the supervisor's per-epoch worker races it
/// against the drain signal and will call it again after cancellation.
#[async_trait]
pub trait ProxyRunner: Send + Sync + 'static {
    /// Spawn the proxy for the given launch spec.
    async fn start(&self, launch: &LaunchSpec) -> Result<(), SpawnError>;

    /// Wait until the epoch is able to serve, or fail if it dies or the
    /// deadline passes. Cancel-safe: the worker races this against the
    /// drain signal.
    async fn await_ready(&self, epoch: Epoch, deadline: Duration) -> Result<(), ReadyError>;

    /// Ask the epoch to stop accepting new work and exit on its own.
    fn signal_drain(&self, epoch: Epoch);

    /// Terminate the epoch immediately.
    fn force_stop(&self, epoch: Epoch);

    /// Wait for the epoch's process to terminate. Cancel-safe.
    async fn wait(&self, epoch: Epoch) -> ExitInfo;
}

// =============================================================================
// Mock runner
// =============================================================================

/// Scripted lifecycle for one mock epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Become ready, exit cleanly when drained.
    Ready,

    /// Fail the spawn itself.
    FailStart,

    /// Never signal readiness; the worker's deadline fires.
    NeverReady,

    /// Die with the given exit code before becoming ready.
    CrashBeforeReady(i32),

    /// Become ready but ignore the drain signal; only a force kill ends it.
    IgnoreDrain,
}

struct MockProc {
    behavior: MockBehavior,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

/// Mock proxy runner for tests: behaviors are scripted per launch, and
/// crashes can be injected at any time with [`MockRunner::crash`].
#[derive(Default)]
pub struct MockRunner {
    script: Mutex<VecDeque<MockBehavior>>,
    procs: Mutex<HashMap<Epoch, MockProc>>,
    launches: Mutex<Vec<LaunchSpec>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the behavior for the next launch. Unscripted launches default
    /// to [`MockBehavior::Ready`].
    pub fn script(&self, behavior: MockBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    /// Inject an unexpected exit for a running epoch.
    pub fn crash(&self, epoch: Epoch, code: i32) {
        self.set_exit(epoch, ExitInfo::with_code(code));
    }

    /// Every launch spec this runner has seen, in order.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// Number of launches performed.
    pub fn started(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    /// Epochs whose process has not exited.
    pub fn live(&self) -> Vec<Epoch> {
        let procs = self.procs.lock().unwrap();
        let mut live: Vec<Epoch> = procs
            .iter()
            .filter(|(_, p)| p.exit_tx.borrow().is_none())
            .map(|(epoch, _)| *epoch)
            .collect();
        live.sort();
        live
    }

    fn behavior(&self, epoch: Epoch) -> Option<MockBehavior> {
        self.procs.lock().unwrap().get(&epoch).map(|p| p.behavior)
    }

    fn set_exit(&self, epoch: Epoch, exit: ExitInfo) {
        let procs = self.procs.lock().unwrap();
        if let Some(proc) = procs.get(&epoch) {
            // First exit wins; later signals against a dead process are
            // no-ops, as with a real child. `send_replace` records the exit
            // even while no `wait` call is subscribed.
            if proc.exit_tx.borrow().is_none() {
                let _ = proc.exit_tx.send_replace(Some(exit));
            }
        }
    }
}

#[async_trait]
impl ProxyRunner for MockRunner {
    async fn start(&self, launch: &LaunchSpec) -> Result<(), SpawnError> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockBehavior::Ready);

        if behavior == MockBehavior::FailStart {
            return Err(SpawnError {
                epoch: launch.epoch,
                source: io::Error::other("mock runner scripted to fail"),
            });
        }

        let (exit_tx, _) = watch::channel(None);
        self.procs
            .lock()
            .unwrap()
            .insert(launch.epoch, MockProc { behavior, exit_tx });
        self.launches.lock().unwrap().push(launch.clone());
        Ok(())
    }

    async fn await_ready(&self, epoch: Epoch, deadline: Duration) -> Result<(), ReadyError> {
        match self.behavior(epoch) {
            Some(MockBehavior::Ready) | Some(MockBehavior::IgnoreDrain) => Ok(()),
            Some(MockBehavior::CrashBeforeReady(code)) => {
                let exit = ExitInfo::with_code(code);
                self.set_exit(epoch, exit);
                Err(ReadyError::Exited(exit))
            }
            Some(MockBehavior::NeverReady) => {
                tokio::time::sleep(deadline).await;
                Err(ReadyError::TimedOut(deadline))
            }
            Some(MockBehavior::FailStart) | None => {
                Err(ReadyError::Exited(ExitInfo::killed()))
            }
        }
    }

    fn signal_drain(&self, epoch: Epoch) {
        match self.behavior(epoch) {
            Some(MockBehavior::IgnoreDrain) => {}
            Some(_) => self.set_exit(epoch, ExitInfo::with_code(0)),
            None => {}
        }
    }

    fn force_stop(&self, epoch: Epoch) {
        self.set_exit(epoch, ExitInfo::killed());
    }

    async fn wait(&self, epoch: Epoch) -> ExitInfo {
        let mut rx = {
            let procs = self.procs.lock().unwrap();
            match procs.get(&epoch) {
                Some(proc) => proc.exit_tx.subscribe(),
                None => return ExitInfo::killed(),
            }
        };

        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return ExitInfo::killed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(epoch: u64) -> LaunchSpec {
        LaunchSpec {
            epoch: Epoch(epoch),
            bootstrap_path: PathBuf::from("/tmp/bootstrap-rev1.json"),
            ready_probe: None,
        }
    }

    #[tokio::test]
    async fn test_mock_default_lifecycle() {
        let runner = MockRunner::new();
        runner.start(&launch(1)).await.unwrap();

        runner
            .await_ready(Epoch(1), Duration::from_secs(1))
            .await
            .unwrap();

        runner.signal_drain(Epoch(1));
        let exit = runner.wait(Epoch(1)).await;
        assert_eq!(exit, ExitInfo::with_code(0));
        assert!(runner.live().is_empty());
    }

    #[tokio::test]
    async fn test_mock_scripted_spawn_failure() {
        let runner = MockRunner::new();
        runner.script(MockBehavior::FailStart);

        let err = runner.start(&launch(1)).await.unwrap_err();
        assert_eq!(err.epoch, Epoch(1));
        assert_eq!(runner.started(), 0);
    }

    #[tokio::test]
    async fn test_mock_exit_recorded_without_active_waiters() {
        let runner = MockRunner::new();
        runner.start(&launch(1)).await.unwrap();

        // Nothing is waiting on this epoch yet; the exit must still be
        // recorded, not dropped.
        runner.force_stop(Epoch(1));
        assert!(runner.live().is_empty());

        let exit = runner.wait(Epoch(1)).await;
        assert!(exit.forced);
    }

    #[tokio::test]
    async fn test_mock_crash_injection_unblocks_wait() {
        let runner = std::sync::Arc::new(MockRunner::new());
        runner.start(&launch(1)).await.unwrap();

        let waiter = tokio::spawn({
            let runner = std::sync::Arc::clone(&runner);
            async move { runner.wait(Epoch(1)).await }
        });

        // Give the waiter a chance to subscribe first.
        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.crash(Epoch(1), 137);

        let exit = waiter.await.unwrap();
        assert_eq!(exit, ExitInfo::with_code(137));
    }

    #[tokio::test]
    async fn test_mock_ignore_drain_requires_force() {
        let runner = MockRunner::new();
        runner.script(MockBehavior::IgnoreDrain);
        runner.start(&launch(1)).await.unwrap();

        runner.signal_drain(Epoch(1));
        assert_eq!(runner.live(), vec![Epoch(1)]);

        runner.force_stop(Epoch(1));
        let exit = runner.wait(Epoch(1)).await;
        assert!(exit.forced);
    }
}
