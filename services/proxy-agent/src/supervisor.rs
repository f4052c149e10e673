//! Epoch Supervisor: the agent's coordination loop.
//!
//! One long-lived task consumes two funnels - inbound configuration updates
//! and epoch lifecycle events - strictly sequentially, so state transitions
//! never race. Per-epoch workers run concurrently but only ever post events;
//! the Live Epoch Set, the Port Reservation Ledger and the desired slot are
//! mutated exclusively by this loop.
//!
//! Coalescing policy: rapid successive updates collapse to the latest.
//! Before every reconciliation the config funnel is drained to the most
//! recent update; intermediate configurations that were superseded before an
//! epoch could start are never applied.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mesh_backoff::RetryBudget;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::events::{Epoch, EpochEvent, ExitInfo};
use crate::ports::PortLedger;
use crate::resolve::{NodeIdentity, ProxyConfig, Resolver, SpecHash};
use crate::runner::{LaunchSpec, ProxyRunner, ReadyError};
use crate::status::{self, StatusHandle, StatusSender};

/// Lifecycle state of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    /// Process spawned, readiness not yet signaled.
    Starting,
    /// Serving traffic.
    Active,
    /// Told to stop accepting work; exits on its own or is force-killed
    /// after the grace period.
    Draining,
}

/// Global supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No live epoch, nothing pending.
    Idle,
    /// An epoch is active and no transition is in flight.
    Serving,
    /// An epoch is starting or draining, or a retry is pending.
    Reconciling,
    /// Retry budget exhausted; waiting for external intervention.
    Degraded,
}

struct EpochEntry {
    state: EpochState,
    config: ProxyConfig,
    spec_hash: SpecHash,
    bootstrap_path: std::path::PathBuf,
    drain_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

/// Handle for delivering configuration updates and observing status.
#[derive(Clone)]
pub struct AgentHandle {
    config_tx: mpsc::Sender<ProxyConfig>,
    status: StatusHandle,
}

impl AgentHandle {
    /// Deliver a new desired configuration.
    ///
    /// Never blocks on reconciliation - the update is queued and the
    /// supervisor converges asynchronously. Returns false if the supervisor
    /// has shut down.
    pub async fn schedule_config_update(&self, config: ProxyConfig) -> bool {
        self.config_tx.send(config).await.is_ok()
    }

    /// Readiness/health signals for external probes.
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }
}

/// The epoch supervisor. Owns all mutable agent state; see module docs.
pub struct EpochSupervisor<R: ProxyRunner> {
    config: Config,
    resolver: Resolver,
    ledger: PortLedger,
    runner: Arc<R>,

    epochs: BTreeMap<Epoch, EpochEntry>,
    next_epoch: Epoch,

    /// Latest configuration received, applied or not.
    desired: Option<ProxyConfig>,

    /// Spec hash of the currently `Active` epoch's configuration.
    active_hash: Option<SpecHash>,

    budget: RetryBudget,
    /// Identifies the current failure streak; stale retry timers carry an
    /// older streak number and are ignored.
    streak: u64,
    retry_pending: bool,

    state: AgentState,

    config_rx: mpsc::Receiver<ProxyConfig>,
    events_rx: mpsc::Receiver<EpochEvent>,
    events_tx: mpsc::Sender<EpochEvent>,

    status: StatusSender,
    shutdown: watch::Receiver<bool>,
}

impl<R: ProxyRunner> EpochSupervisor<R> {
    /// Create a supervisor and its external handle.
    pub fn new(
        config: Config,
        runner: Arc<R>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, AgentHandle) {
        let (config_tx, config_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = status::channel();

        let resolver = Resolver::new(NodeIdentity {
            node_id: config.node_id.clone(),
            cluster: config.cluster.clone(),
        });
        let budget = config.retry_budget();

        let supervisor = Self {
            config,
            resolver,
            ledger: PortLedger::default(),
            runner,
            epochs: BTreeMap::new(),
            next_epoch: Epoch(1),
            desired: None,
            active_hash: None,
            budget,
            streak: 0,
            retry_pending: false,
            state: AgentState::Idle,
            config_rx,
            events_rx,
            events_tx,
            status: status_tx,
            shutdown,
        };

        let handle = AgentHandle {
            config_tx,
            status: status_rx,
        };

        (supervisor, handle)
    }

    /// Global supervisor state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The currently active epoch, if any.
    pub fn active_epoch(&self) -> Option<Epoch> {
        self.epochs
            .iter()
            .find(|(_, e)| e.state == EpochState::Active)
            .map(|(epoch, _)| *epoch)
    }

    /// Snapshot of the live epoch set.
    pub fn live_epochs(&self) -> Vec<(Epoch, EpochState)> {
        self.epochs.iter().map(|(e, entry)| (*e, entry.state)).collect()
    }

    /// Run the coordination loop until shutdown; returns teardown errors
    /// aggregated per epoch.
    pub async fn run(mut self) -> Vec<(Epoch, AgentError)> {
        info!(
            config_dir = %self.config.config_dir.display(),
            "Supervisor entering coordination loop"
        );

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Supervisor received shutdown signal");
                        break;
                    }
                }

                Some(config) = self.config_rx.recv() => {
                    self.accept_config(config);
                    self.maybe_reconcile().await;
                }

                Some(event) = self.events_rx.recv() => {
                    self.on_event(event).await;
                }
            }
        }

        self.teardown().await
    }

    /// Record an inbound configuration as the desired one.
    fn accept_config(&mut self, config: ProxyConfig) {
        debug!(hash = %config.spec_hash(), "Received configuration update");
        self.desired = Some(config);

        // Any external update opens a fresh streak: pending retry timers
        // become stale and the backoff budget resets.
        self.streak += 1;
        self.retry_pending = false;
        self.budget.record_success();

        if self.state == AgentState::Degraded {
            info!("Configuration update received, leaving degraded state");
            self.state = AgentState::Reconciling;
            self.status.set_healthy(true);
        }
    }

    /// Start a new epoch for the desired configuration if one is due.
    async fn maybe_reconcile(&mut self) {
        self.reconcile_step().await;
        self.recompute_state();
    }

    async fn reconcile_step(&mut self) {
        // Coalesce: everything already queued collapses to the latest.
        while let Ok(config) = self.config_rx.try_recv() {
            self.accept_config(config);
        }

        if self.state == AgentState::Degraded || self.retry_pending {
            return;
        }
        // Epoch creation is serialized: never two `Starting` at once.
        if self.epochs.values().any(|e| e.state == EpochState::Starting) {
            return;
        }

        let Some(config) = self.desired.clone() else {
            return;
        };

        let hash = config.spec_hash();
        if self.active_hash.as_ref() == Some(&hash) {
            debug!(hash = %hash, "Desired configuration already active");
            self.desired = None;
            return;
        }

        let epoch = self.next_epoch;
        match self.start_epoch(epoch, &config).await {
            Ok(entry) => {
                self.next_epoch = epoch.next();
                self.epochs.insert(epoch, entry);
                info!(epoch = %epoch, hash = %hash, "Epoch starting");
            }
            Err(e) => {
                warn!(
                    epoch = %epoch,
                    error = %e,
                    attempt = self.budget.attempts() + 1,
                    "Reconciliation attempt failed"
                );
                self.record_failure();
            }
        }
    }

    /// Resolve, reserve, render and spawn one epoch. Failures leave no
    /// residue: reservations and artifacts are rolled back, and no live
    /// epoch changes state.
    async fn start_epoch(
        &mut self,
        epoch: Epoch,
        config: &ProxyConfig,
    ) -> Result<EpochEntry, AgentError> {
        let bootstrap = self.resolver.resolve(config)?;
        let bound = self.ledger.reserve(epoch, &config.listeners)?;

        let bootstrap_path =
            match bootstrap.write_artifact(&self.config.config_dir, epoch, &bound) {
                Ok(path) => path,
                Err(e) => {
                    self.ledger.release(epoch);
                    return Err(AgentError::Artifact(e));
                }
            };

        // Close the probe sockets so the proxy can bind its ports; the
        // logical claims stay until the epoch exits.
        self.ledger.handoff(epoch);

        let launch = LaunchSpec {
            epoch,
            bootstrap_path: bootstrap_path.clone(),
            ready_probe: bound.first().map(|b| b.addr),
        };

        if let Err(e) = self.runner.start(&launch).await {
            self.ledger.release(epoch);
            remove_artifact(&bootstrap_path);
            return Err(e.into());
        }

        let (drain_tx, drain_rx) = watch::channel(false);
        let worker = tokio::spawn(run_epoch_worker(
            Arc::clone(&self.runner),
            epoch,
            self.config.ready_timeout,
            self.config.drain_grace,
            drain_rx,
            self.events_tx.clone(),
        ));

        Ok(EpochEntry {
            state: EpochState::Starting,
            config: config.clone(),
            spec_hash: bootstrap.spec_hash,
            bootstrap_path,
            drain_tx,
            worker,
        })
    }

    async fn on_event(&mut self, event: EpochEvent) {
        match event {
            EpochEvent::Ready { epoch } => self.on_epoch_ready(epoch).await,
            EpochEvent::Exited { epoch, exit } => self.on_epoch_exit(epoch, exit).await,
            EpochEvent::RetryElapsed { streak } => {
                if streak != self.streak || !self.retry_pending {
                    debug!(streak, current = self.streak, "Ignoring stale retry timer");
                } else {
                    self.retry_pending = false;
                    self.maybe_reconcile().await;
                }
            }
        }
        self.recompute_state();
    }

    /// The new epoch can serve: promote it and drain everything else.
    async fn on_epoch_ready(&mut self, epoch: Epoch) {
        match self.epochs.get_mut(&epoch) {
            Some(entry) if entry.state == EpochState::Starting => {
                entry.state = EpochState::Active;
                self.active_hash = Some(entry.spec_hash.clone());
            }
            Some(entry) => {
                debug!(epoch = %epoch, state = ?entry.state, "Stale ready event");
                return;
            }
            None => {
                debug!(epoch = %epoch, "Ready event for unknown epoch");
                return;
            }
        }

        info!(epoch = %epoch, "Epoch active");
        self.budget.record_success();
        self.streak += 1;
        self.retry_pending = false;
        self.status.set_ready(true);

        if self
            .desired
            .as_ref()
            .map(|c| c.spec_hash())
            .as_ref()
            == self.active_hash.as_ref()
        {
            self.desired = None;
        }

        for (&other, entry) in self.epochs.iter_mut() {
            if other != epoch && entry.state != EpochState::Draining {
                info!(epoch = %other, "Draining superseded epoch");
                entry.state = EpochState::Draining;
                let _ = entry.drain_tx.send(true);
            }
        }

        // A newer configuration may have arrived while this epoch started.
        self.maybe_reconcile().await;
    }

    /// An epoch's process terminated; release its resources and decide
    /// whether the exit demands a restart.
    async fn on_epoch_exit(&mut self, epoch: Epoch, exit: ExitInfo) {
        let Some(entry) = self.epochs.remove(&epoch) else {
            debug!(epoch = %epoch, "Exit event for unknown epoch");
            return;
        };

        self.ledger.release(epoch);
        remove_artifact(&entry.bootstrap_path);

        if entry.state == EpochState::Draining {
            // Supervisor-initiated shutdown, including grace-period kills:
            // not a failure.
            info!(epoch = %epoch, exit = %exit, "Epoch drained and exited");
        } else {
            let err = AgentError::UnexpectedExit { epoch, exit };
            warn!(error = %err, state = ?entry.state, "Epoch exited unexpectedly");

            if entry.state == EpochState::Active {
                self.active_hash = None;
                self.status.set_ready(false);
            }

            // Restart with the dead epoch's configuration unless a newer
            // one is pending or already starting.
            let starting = self.epochs.values().any(|e| e.state == EpochState::Starting);
            if self.desired.is_none() && !starting {
                self.desired = Some(entry.config);
            }

            self.record_failure();
        }

        self.maybe_reconcile().await;
    }

    /// Consume one unit of retry budget; schedule a retry or degrade.
    fn record_failure(&mut self) {
        match self.budget.record_failure() {
            Ok(delay) => {
                warn!(
                    attempt = self.budget.attempts(),
                    remaining = self.budget.remaining(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconciliation retry"
                );
                self.retry_pending = true;
                let streak = self.streak;
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(EpochEvent::RetryElapsed { streak }).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Entering degraded state");
                self.state = AgentState::Degraded;
                self.status.set_healthy(false);
                // The last desired configuration stays in the slot for
                // diagnostics; a new external update resets the streak.
            }
        }
    }

    fn recompute_state(&mut self) {
        if self.state == AgentState::Degraded {
            return;
        }

        let transitioning = self
            .epochs
            .values()
            .any(|e| e.state != EpochState::Active);

        self.state = if transitioning || self.desired.is_some() || self.retry_pending {
            AgentState::Reconciling
        } else if self.active_epoch().is_some() {
            AgentState::Serving
        } else {
            AgentState::Idle
        };
    }

    /// Drain every live epoch and collect per-epoch teardown errors.
    async fn teardown(&mut self) -> Vec<(Epoch, AgentError)> {
        info!(live = self.epochs.len(), "Supervisor shutting down");
        let mut errors: Vec<(Epoch, AgentError)> = Vec::new();

        for entry in self.epochs.values_mut() {
            entry.state = EpochState::Draining;
            let _ = entry.drain_tx.send(true);
        }

        // Workers force-kill on their own after the grace period; the
        // margin here only guards against a stuck worker task.
        let deadline = self.config.drain_grace + Duration::from_secs(2);
        let live: Vec<Epoch> = self.epochs.keys().copied().collect();

        for epoch in live {
            let Some(entry) = self.epochs.remove(&epoch) else {
                continue;
            };

            match tokio::time::timeout(deadline, entry.worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push((epoch, AgentError::Worker(e.to_string()))),
                Err(_) => {
                    self.runner.force_stop(epoch);
                    errors.push((
                        epoch,
                        AgentError::Worker("worker did not finish within the grace period".into()),
                    ));
                }
            }

            self.ledger.release(epoch);
            remove_artifact(&entry.bootstrap_path);
        }

        self.status.set_ready(false);
        info!(errors = errors.len(), "Supervisor shutdown complete");
        errors
    }
}

/// Remove a per-epoch bootstrap artifact; missing files are fine.
fn remove_artifact(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove bootstrap artifact");
        }
    }
}

/// Per-epoch worker: watches one process from readiness to exit and posts
/// the outcome into the supervisor's event funnel. Never mutates shared
/// state.
async fn run_epoch_worker<R: ProxyRunner>(
    runner: Arc<R>,
    epoch: Epoch,
    ready_timeout: Duration,
    drain_grace: Duration,
    mut drain_rx: watch::Receiver<bool>,
    events: mpsc::Sender<EpochEvent>,
) {
    tokio::select! {
        result = runner.await_ready(epoch, ready_timeout) => match result {
            Ok(()) => {
                if events.send(EpochEvent::Ready { epoch }).await.is_err() {
                    return;
                }
            }
            Err(ReadyError::Exited(exit)) => {
                let _ = events.send(EpochEvent::Exited { epoch, exit }).await;
                return;
            }
            Err(ReadyError::TimedOut(deadline)) => {
                warn!(epoch = %epoch, ?deadline, "Epoch never became ready, killing");
                runner.force_stop(epoch);
                let mut exit = runner.wait(epoch).await;
                exit.forced = true;
                let _ = events.send(EpochEvent::Exited { epoch, exit }).await;
                return;
            }
        },

        // Drained before it ever became ready (typically agent shutdown):
        // wind it down like any other draining epoch.
        _ = drain_requested(&mut drain_rx) => {
            let exit = drain_and_wait(runner.as_ref(), epoch, drain_grace).await;
            let _ = events.send(EpochEvent::Exited { epoch, exit }).await;
            return;
        }
    }

    let exit = tokio::select! {
        exit = runner.wait(epoch) => exit,
        _ = drain_requested(&mut drain_rx) => {
            drain_and_wait(runner.as_ref(), epoch, drain_grace).await
        }
    };

    let _ = events.send(EpochEvent::Exited { epoch, exit }).await;
}

/// Resolve once draining has been requested. A closed channel means the
/// supervisor is gone and counts as a drain request.
async fn drain_requested(drain_rx: &mut watch::Receiver<bool>) {
    while drain_rx.changed().await.is_ok() {
        if *drain_rx.borrow() {
            return;
        }
    }
}

/// Ask an epoch to exit on its own, force-killing it once the grace period
/// expires.
async fn drain_and_wait<R: ProxyRunner + ?Sized>(
    runner: &R,
    epoch: Epoch,
    grace: Duration,
) -> ExitInfo {
    runner.signal_drain(epoch);
    match tokio::time::timeout(grace, runner.wait(epoch)).await {
        Ok(exit) => exit,
        Err(_) => {
            warn!(epoch = %epoch, "Drain grace period expired, force-killing");
            runner.force_stop(epoch);
            let mut exit = runner.wait(epoch).await;
            exit.forced = true;
            exit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ListenerSpec;
    use crate::runner::{MockBehavior, MockRunner};

    fn test_config(dir: &Path) -> Config {
        Config {
            proxy_path: "/usr/local/bin/mesh-proxy".into(),
            config_dir: dir.to_path_buf(),
            discovery_addr: "127.0.0.1:15010".into(),
            cluster: "test".into(),
            node_id: "node-a".into(),
            drain_grace: Duration::from_millis(200),
            ready_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            max_retries: 2,
            log_level: "info".into(),
        }
    }

    fn proxy_config(discovery: &str) -> ProxyConfig {
        ProxyConfig {
            discovery_addr: discovery.to_string(),
            listeners: vec![ListenerSpec::ephemeral("inbound")],
            settings: serde_json::Value::Null,
        }
    }

    fn setup(
        runner: Arc<MockRunner>,
        dir: &Path,
    ) -> (EpochSupervisor<MockRunner>, AgentHandle) {
        // The sender may drop: these tests drive the supervisor directly
        // instead of through `run`, so shutdown is never polled.
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        EpochSupervisor::new(test_config(dir), runner, shutdown_rx)
    }

    #[tokio::test]
    async fn test_reconcile_starts_single_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;

        assert_eq!(runner.started(), 1);
        assert_eq!(sup.live_epochs(), vec![(Epoch(1), EpochState::Starting)]);
    }

    #[tokio::test]
    async fn test_updates_coalesce_to_latest() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.accept_config(proxy_config("127.0.0.1:15011"));
        sup.maybe_reconcile().await;

        // Only the latest configuration produced an epoch.
        assert_eq!(runner.started(), 1);
        let artifact: serde_json::Value = serde_json::from_slice(
            &std::fs::read(&runner.launches()[0].bootstrap_path).unwrap(),
        )
        .unwrap();
        assert_eq!(artifact["discovery_addr"], "127.0.0.1:15011");
    }

    #[tokio::test]
    async fn test_ready_promotes_and_drains_others() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;
        assert_eq!(sup.active_epoch(), Some(Epoch(1)));

        sup.accept_config(proxy_config("127.0.0.1:15011"));
        sup.maybe_reconcile().await;
        assert_eq!(runner.started(), 2);

        sup.on_event(EpochEvent::Ready { epoch: Epoch(2) }).await;

        // Mutual exclusion: exactly one active epoch.
        assert_eq!(sup.active_epoch(), Some(Epoch(2)));
        assert_eq!(
            sup.live_epochs(),
            vec![
                (Epoch(1), EpochState::Draining),
                (Epoch(2), EpochState::Active),
            ]
        );
    }

    #[tokio::test]
    async fn test_identical_config_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;

        assert_eq!(runner.started(), 1);
        assert_eq!(sup.state(), AgentState::Serving);
    }

    #[tokio::test]
    async fn test_expected_exit_releases_resources_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;

        sup.accept_config(proxy_config("127.0.0.1:15011"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(2) }).await;

        let artifact_1 = runner.launches()[0].bootstrap_path.clone();
        sup.on_event(EpochEvent::Exited {
            epoch: Epoch(1),
            exit: ExitInfo::with_code(0),
        })
        .await;

        assert_eq!(sup.live_epochs(), vec![(Epoch(2), EpochState::Active)]);
        assert_eq!(sup.state(), AgentState::Serving);
        assert!(!artifact_1.exists());
        // No retry was scheduled for an expected exit.
        assert!(!sup.retry_pending);
    }

    #[tokio::test]
    async fn test_unexpected_exit_schedules_retry_then_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;

        // Crash the active epoch: retry 1 scheduled.
        sup.on_event(EpochEvent::Exited {
            epoch: Epoch(1),
            exit: ExitInfo::with_code(134),
        })
        .await;
        assert!(sup.retry_pending);
        // The dead epoch's configuration was restored for the restart.
        assert!(sup.desired.is_some());

        // Let the retry start epoch 2, then crash it while starting.
        let streak = sup.streak;
        sup.on_event(EpochEvent::RetryElapsed { streak }).await;
        assert_eq!(runner.started(), 2);
        sup.on_event(EpochEvent::Exited {
            epoch: Epoch(2),
            exit: ExitInfo::with_code(134),
        })
        .await;

        // Budget (2) exhausted on the next failure.
        let streak = sup.streak;
        sup.on_event(EpochEvent::RetryElapsed { streak }).await;
        assert_eq!(runner.started(), 3);
        sup.on_event(EpochEvent::Exited {
            epoch: Epoch(3),
            exit: ExitInfo::with_code(134),
        })
        .await;

        assert_eq!(sup.state(), AgentState::Degraded);
        assert!(!_handle.status().is_healthy());

        // Degraded: stale timers must not restart anything.
        let streak = sup.streak;
        sup.on_event(EpochEvent::RetryElapsed { streak }).await;
        assert_eq!(runner.started(), 3);
    }

    #[tokio::test]
    async fn test_new_config_resets_degraded_state() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, handle) = setup(Arc::clone(&runner), dir.path());

        sup.state = AgentState::Degraded;
        sup.status.set_healthy(false);

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;

        assert_ne!(sup.state(), AgentState::Degraded);
        assert!(handle.status().is_healthy());
        assert_eq!(runner.started(), 1);
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_previous_epoch_serving() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;

        runner.script(MockBehavior::FailStart);
        sup.accept_config(proxy_config("127.0.0.1:15011"));
        sup.maybe_reconcile().await;

        // Epoch 1 keeps serving; the failure only armed a retry.
        assert_eq!(sup.active_epoch(), Some(Epoch(1)));
        assert_eq!(sup.live_epochs(), vec![(Epoch(1), EpochState::Active)]);
        assert!(sup.retry_pending);
    }

    #[tokio::test]
    async fn test_out_of_order_ready_events_keep_single_active() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;

        sup.accept_config(proxy_config("127.0.0.1:15011"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(2) }).await;

        // A late ready for the now-draining epoch must not re-promote it.
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;
        assert_eq!(sup.active_epoch(), Some(Epoch(2)));
        assert_eq!(
            sup.live_epochs(),
            vec![
                (Epoch(1), EpochState::Draining),
                (Epoch(2), EpochState::Active),
            ]
        );

        // A duplicate ready for the active epoch changes nothing either.
        sup.on_event(EpochEvent::Ready { epoch: Epoch(2) }).await;
        assert_eq!(sup.active_epoch(), Some(Epoch(2)));
        assert_eq!(runner.started(), 2);
    }

    #[tokio::test]
    async fn test_exit_for_unknown_epoch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new());
        let (mut sup, _handle) = setup(Arc::clone(&runner), dir.path());

        sup.accept_config(proxy_config("127.0.0.1:15010"));
        sup.maybe_reconcile().await;
        sup.on_event(EpochEvent::Ready { epoch: Epoch(1) }).await;

        sup.on_event(EpochEvent::Exited {
            epoch: Epoch(9),
            exit: ExitInfo::with_code(1),
        })
        .await;

        // Nothing restarted, nothing retried, nothing demoted.
        assert_eq!(sup.active_epoch(), Some(Epoch(1)));
        assert_eq!(sup.state(), AgentState::Serving);
        assert!(!sup.retry_pending);
        assert_eq!(runner.started(), 1);
    }
}
