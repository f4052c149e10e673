//! Config Resolver: abstract mesh configuration -> concrete bootstrap.
//!
//! `Resolver` is a pure function of its inputs plus read-only node identity
//! cached at construction. It retains no mutable state across calls; errors
//! surface to the caller and count as a failed reconciliation attempt.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::events::Epoch;
use crate::ports::{BoundListener, ListenerSpec};

/// Abstract mesh configuration delivered by the external watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Discovery service address ("host:port").
    pub discovery_addr: String,

    /// Listeners the proxy must bind.
    pub listeners: Vec<ListenerSpec>,

    /// Opaque mesh settings forwarded into the bootstrap verbatim.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl ProxyConfig {
    /// Content-addressed identity of this configuration.
    ///
    /// Two configurations with the same hash are semantically identical and
    /// must not trigger a new epoch. serde_json renders object keys in
    /// sorted order, so the serialized bytes are canonical.
    pub fn spec_hash(&self) -> SpecHash {
        // Plain data with string-keyed maps: serialization cannot fail.
        let bytes = serde_json::to_vec(self).expect("ProxyConfig serializes to JSON");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        SpecHash(format!("sha256:{}", hex::encode(&digest[..16])))
    }
}

/// A spec hash for deterministic configuration comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolution errors. Fatal to the current reconciliation attempt; retried
/// per the supervisor's backoff budget.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Discovery address is not a valid "host:port" pair.
    #[error("invalid discovery address {addr:?}: {reason}")]
    InvalidDiscoveryAddr { addr: String, reason: String },

    /// The configuration declares no listeners to bind.
    #[error("configuration declares no listeners")]
    NoListeners,

    /// Two listeners share a logical name.
    #[error("duplicate listener name {0:?}")]
    DuplicateListener(String),
}

/// Read-only identity of the local workload.
#[derive(Debug, Clone, Serialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub cluster: String,
}

/// Concrete, immutable configuration artifact a new epoch starts with.
#[derive(Debug, Clone, Serialize)]
pub struct Bootstrap {
    /// Identity of the configuration this bootstrap was resolved from.
    #[serde(skip)]
    pub spec_hash: SpecHash,

    pub node: NodeIdentity,
    pub discovery_addr: String,
    pub listeners: Vec<ListenerSpec>,
    pub settings: serde_json::Value,
}

/// Rendered on-disk form of a bootstrap, with concrete bound addresses.
#[derive(Debug, Serialize)]
struct BootstrapArtifact<'a> {
    epoch: u64,
    node: &'a NodeIdentity,
    discovery_addr: &'a str,
    listeners: &'a [BoundListener],
    settings: &'a serde_json::Value,
}

impl Bootstrap {
    /// Write the per-epoch bootstrap artifact and return its path.
    ///
    /// One artifact exists per live epoch (`bootstrap-rev{epoch}.json`); the
    /// supervisor removes it when the epoch's bookkeeping is destroyed.
    pub fn write_artifact(
        &self,
        dir: &Path,
        epoch: Epoch,
        bound: &[BoundListener],
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = artifact_path(dir, epoch);

        let artifact = BootstrapArtifact {
            epoch: epoch.0,
            node: &self.node,
            discovery_addr: &self.discovery_addr,
            listeners: bound,
            settings: &self.settings,
        };

        let rendered = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, rendered)?;
        Ok(path)
    }
}

/// Path of the bootstrap artifact for an epoch.
pub fn artifact_path(dir: &Path, epoch: Epoch) -> PathBuf {
    dir.join(format!("bootstrap-rev{epoch}.json"))
}

/// Resolves abstract configurations into concrete bootstraps.
pub struct Resolver {
    identity: NodeIdentity,
}

impl Resolver {
    /// Create a resolver with the local node identity.
    pub fn new(identity: NodeIdentity) -> Self {
        Self { identity }
    }

    /// Materialize the bootstrap for a configuration.
    pub fn resolve(&self, config: &ProxyConfig) -> Result<Bootstrap, ResolutionError> {
        let discovery_addr = normalize_host_port(&config.discovery_addr)?;

        if config.listeners.is_empty() {
            return Err(ResolutionError::NoListeners);
        }

        let mut seen = std::collections::HashSet::new();
        for listener in &config.listeners {
            if !seen.insert(listener.name.as_str()) {
                return Err(ResolutionError::DuplicateListener(listener.name.clone()));
            }
        }

        Ok(Bootstrap {
            spec_hash: config.spec_hash(),
            node: self.identity.clone(),
            discovery_addr,
            listeners: config.listeners.clone(),
            settings: config.settings.clone(),
        })
    }
}

/// Validate a "host:port" pair without performing name resolution.
fn normalize_host_port(addr: &str) -> Result<String, ResolutionError> {
    let invalid = |reason: &str| ResolutionError::InvalidDiscoveryAddr {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port: u16 = port.parse().map_err(|_| invalid("port is not a u16"))?;
    if port == 0 {
        return Err(invalid("port must be nonzero"));
    }

    Ok(format!("{host}:{port}"))
}
