//! Port Reservation Ledger.
//!
//! Tracks which local bind addresses are claimed by live or draining epochs
//! and grants conflict-free port sets to starting epochs.
//!
//! ## Strategy: exclusive binding with ephemeral rebind
//!
//! Each epoch binds its own distinct ports; there is no shared-bind
//! (SO_REUSEPORT) assumption. A `Fixed` listener is granted only while no
//! other live epoch claims that port - a collision fails the whole
//! reservation and defers to the retry governor. An `Ephemeral` listener is
//! discovered by binding port 0. Redirecting traffic from a draining epoch's
//! ports to the new epoch's ports is the proxy's own handoff step.
//!
//! Reservations hold the OS socket from `reserve` until either `release` or
//! `handoff`. The supervisor calls `handoff` immediately before spawning the
//! proxy so the child can bind the granted ports; the logical claims survive
//! the handoff, so no later epoch can be granted the same fixed port while
//! the owner is still live.
//!
//! The ledger is owned and mutated only by the coordination loop
//! (single-writer), so it needs no interior locking.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::events::Epoch;

/// A listener the proxy must bind, as named in the mesh configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    /// Logical listener name (e.g. "inbound", "outbound", "admin").
    pub name: String,

    /// Requested port. `None` requests an ephemeral port.
    pub port: Option<u16>,
}

impl ListenerSpec {
    /// A listener on a well-known port.
    pub fn fixed(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
        }
    }

    /// A listener on an ephemeral port.
    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
        }
    }
}

/// A listener granted to an epoch: logical name plus concrete address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundListener {
    pub name: String,
    pub addr: SocketAddr,
}

/// Reservation failure: some requested address is already in use.
///
/// The failed call rolls back every bind it made, so a conflict never leaves
/// a half-bound epoch holding resources.
#[derive(Debug, Error)]
#[error("listener {name:?} failed to bind {addr}: {source}")]
pub struct ConflictError {
    /// Logical name of the listener that collided.
    pub name: String,

    /// Address that could not be bound.
    pub addr: SocketAddr,

    #[source]
    source: io::Error,
}

struct Reservation {
    name: String,
    addr: SocketAddr,
    /// Held from `reserve` until `release` or `handoff`.
    socket: Option<TcpListener>,
}

/// Ledger of per-epoch port claims.
pub struct PortLedger {
    host: IpAddr,
    claims: HashMap<Epoch, Vec<Reservation>>,
}

impl PortLedger {
    /// Create a ledger binding on the given host address.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            claims: HashMap::new(),
        }
    }

    /// Attempt to bind every requested listener for `epoch`.
    ///
    /// All-or-nothing: if any listener fails to bind, every bind made by
    /// this call is rolled back and `ConflictError` is returned. A fixed
    /// port claimed by another live epoch conflicts even if its socket has
    /// already been handed off to the proxy process.
    pub fn reserve(
        &mut self,
        epoch: Epoch,
        specs: &[ListenerSpec],
    ) -> Result<Vec<BoundListener>, ConflictError> {
        // Re-reserving an epoch replaces its previous claims.
        self.release(epoch);

        let mut granted: Vec<Reservation> = Vec::with_capacity(specs.len());

        for spec in specs {
            let requested = SocketAddr::new(self.host, spec.port.unwrap_or(0));

            // Fixed ports must not collide with any live epoch's claim,
            // including handed-off claims the OS no longer sees as bound
            // by us.
            if let Some(port) = spec.port {
                if let Some(owner) = self.claim_owner(port) {
                    return Err(ConflictError {
                        name: spec.name.clone(),
                        addr: requested,
                        source: io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("port {port} claimed by epoch {owner}"),
                        ),
                    });
                }
                // A duplicate inside the same request is a conflict too.
                if granted.iter().any(|r| r.addr.port() == port) {
                    return Err(ConflictError {
                        name: spec.name.clone(),
                        addr: requested,
                        source: io::Error::new(
                            io::ErrorKind::AddrInUse,
                            "port requested twice in one reservation",
                        ),
                    });
                }
            }

            let socket = match TcpListener::bind(requested) {
                Ok(socket) => socket,
                Err(source) => {
                    // Rollback: dropping `granted` closes every socket this
                    // call bound, and no claims were recorded yet.
                    return Err(ConflictError {
                        name: spec.name.clone(),
                        addr: requested,
                        source,
                    });
                }
            };

            let addr = match socket.local_addr() {
                Ok(addr) => addr,
                Err(source) => {
                    return Err(ConflictError {
                        name: spec.name.clone(),
                        addr: requested,
                        source,
                    });
                }
            };

            granted.push(Reservation {
                name: spec.name.clone(),
                addr,
                socket: Some(socket),
            });
        }

        let bound: Vec<BoundListener> = granted
            .iter()
            .map(|r| BoundListener {
                name: r.name.clone(),
                addr: r.addr,
            })
            .collect();

        debug!(epoch = %epoch, listeners = bound.len(), "Reserved port set");
        self.claims.insert(epoch, granted);
        Ok(bound)
    }

    /// Close and remove all bindings owned by `epoch`.
    ///
    /// Idempotent: releasing an epoch with no reservations is a no-op.
    /// Returns the number of claims released.
    pub fn release(&mut self, epoch: Epoch) -> usize {
        match self.claims.remove(&epoch) {
            Some(reservations) => {
                debug!(epoch = %epoch, count = reservations.len(), "Released port set");
                reservations.len()
            }
            None => 0,
        }
    }

    /// Drop the held OS sockets for `epoch` so the proxy process can bind
    /// them, keeping the logical claims alive until `release`.
    pub fn handoff(&mut self, epoch: Epoch) -> usize {
        let Some(reservations) = self.claims.get_mut(&epoch) else {
            return 0;
        };

        let mut dropped = 0;
        for r in reservations.iter_mut() {
            if r.socket.take().is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Number of claims currently held by `epoch`.
    pub fn claimed(&self, epoch: Epoch) -> usize {
        self.claims.get(&epoch).map(Vec::len).unwrap_or(0)
    }

    /// Which live epoch, if any, claims the given port.
    fn claim_owner(&self, port: u16) -> Option<Epoch> {
        self.claims.iter().find_map(|(epoch, reservations)| {
            reservations
                .iter()
                .any(|r| r.addr.port() == port)
                .then_some(*epoch)
        })
    }
}

impl Default for PortLedger {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}
