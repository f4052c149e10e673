//! Mesh Proxy Agent Library
//!
//! The proxy agent runs as a sidecar next to each workload and manages the
//! lifecycle of its data-plane proxy. Configuration updates arrive from an
//! external watcher; the agent converges by starting a new proxy epoch for
//! each configuration and draining the old one once its successor is ready.
//!
//! ## Architecture
//!
//! - **Epoch Supervisor**: single coordination loop owning all agent state
//! - **Port Ledger**: all-or-nothing listener port reservation per epoch
//! - **Config Resolver**: abstract mesh config -> concrete bootstrap artifact
//! - **Proxy Runner**: process abstraction (OS-backed in prod, mock in tests)
//!
//! ## Modules
//!
//! - `supervisor`: the epoch state machine and per-epoch workers
//! - `ports`: the port reservation ledger
//! - `resolve`: configuration resolution and bootstrap rendering
//! - `process`: the OS process runner
//! - `status`: readiness/health signals for external probes

pub mod config;
pub mod error;
pub mod events;
pub mod ports;
pub mod process;
pub mod resolve;
pub mod runner;
pub mod status;
pub mod supervisor;

// Re-export commonly used types
pub use error::AgentError;
pub use events::{Epoch, EpochEvent, ExitInfo};
pub use resolve::{ProxyConfig, SpecHash};
pub use runner::{MockBehavior, MockRunner, ProxyRunner};
pub use status::StatusHandle;
pub use supervisor::{AgentHandle, AgentState, EpochState, EpochSupervisor};
