//! Error taxonomy for the agent.

use thiserror::Error;

use crate::events::{Epoch, ExitInfo};
use crate::ports::ConflictError;
use crate::resolve::ResolutionError;
use crate::runner::SpawnError;

/// Errors surfaced by a reconciliation attempt or a running epoch.
///
/// Every variant except `Worker` is retryable per the supervisor's backoff
/// budget; budget exhaustion itself is reported via
/// [`mesh_backoff::BudgetExhausted`] and flips the agent's health signal.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The abstract configuration could not be resolved into a bootstrap.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Port reservation collided with an existing binding.
    #[error(transparent)]
    PortConflict(#[from] ConflictError),

    /// The proxy process could not be spawned.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// An epoch's process died outside of a supervisor-initiated drain.
    #[error("epoch {epoch} exited unexpectedly ({exit})")]
    UnexpectedExit { epoch: Epoch, exit: ExitInfo },

    /// The bootstrap artifact could not be written or removed.
    #[error("bootstrap artifact i/o: {0}")]
    Artifact(#[source] std::io::Error),

    /// An epoch worker task failed during teardown.
    #[error("epoch worker failed: {0}")]
    Worker(String),
}
