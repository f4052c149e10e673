//! Epoch identity and the event funnel payloads.
//!
//! Per-epoch workers never touch supervisor state directly - they post
//! `EpochEvent`s into the supervisor's event funnel and the coordination
//! loop applies all state transitions serially.

use std::fmt;

/// One generation of the supervised proxy process.
///
/// Epoch numbers are issued in strictly increasing order by the supervisor
/// and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The next epoch number.
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exit information for a terminated proxy process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Process exit code, if the process exited on its own.
    pub code: Option<i32>,

    /// Whether the supervisor force-killed the process after the drain
    /// grace period expired.
    pub forced: bool,
}

impl ExitInfo {
    /// An exit produced by a grace-period force kill.
    pub fn killed() -> Self {
        Self {
            code: None,
            forced: true,
        }
    }

    /// A self-initiated exit with the given code.
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            forced: false,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.forced) {
            (_, true) => write!(f, "force-killed"),
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, _) => write!(f, "terminated by signal"),
        }
    }
}

/// Events posted into the supervisor's event funnel.
#[derive(Debug)]
pub enum EpochEvent {
    /// The epoch bound its listeners and completed its startup check.
    Ready { epoch: Epoch },

    /// The epoch's process terminated.
    Exited { epoch: Epoch, exit: ExitInfo },

    /// A scheduled retry backoff elapsed. `streak` identifies the failure
    /// streak the timer was armed for; stale timers are ignored.
    RetryElapsed { streak: u64 },
}
