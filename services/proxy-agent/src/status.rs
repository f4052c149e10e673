//! Readiness and health signals for external probes.
//!
//! - `ready`: an epoch is `Active` and serving.
//! - `healthy`: the agent is not `Degraded` (retry budget not exhausted).

use tokio::sync::watch;

/// Sender side, owned by the supervisor.
pub(crate) struct StatusSender {
    ready: watch::Sender<bool>,
    healthy: watch::Sender<bool>,
}

impl StatusSender {
    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.send_if_modified(|v| {
            let changed = *v != ready;
            *v = ready;
            changed
        });
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.send_if_modified(|v| {
            let changed = *v != healthy;
            *v = healthy;
            changed
        });
    }
}

/// Receiver side, handed to liveness/readiness probe plumbing.
#[derive(Clone)]
pub struct StatusHandle {
    ready: watch::Receiver<bool>,
    healthy: watch::Receiver<bool>,
}

impl StatusHandle {
    /// Whether an epoch is currently serving.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Whether the agent is not degraded.
    pub fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    /// Wait for the readiness signal to change.
    pub async fn ready_changed(&mut self) -> bool {
        let _ = self.ready.changed().await;
        *self.ready.borrow()
    }

    /// Wait for the health signal to change.
    pub async fn healthy_changed(&mut self) -> bool {
        let _ = self.healthy.changed().await;
        *self.healthy.borrow()
    }
}

/// Create a linked status sender/handle pair. A fresh agent is not ready
/// (no active epoch yet) but healthy.
pub(crate) fn channel() -> (StatusSender, StatusHandle) {
    let (ready_tx, ready_rx) = watch::channel(false);
    let (healthy_tx, healthy_rx) = watch::channel(true);
    (
        StatusSender {
            ready: ready_tx,
            healthy: healthy_tx,
        },
        StatusHandle {
            ready: ready_rx,
            healthy: healthy_rx,
        },
    )
}
