//! Configuration for the proxy agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use mesh_backoff::{BackoffPolicy, RetryBudget};

/// Proxy agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the proxy binary.
    pub proxy_path: PathBuf,

    /// Directory for per-epoch bootstrap artifacts.
    pub config_dir: PathBuf,

    /// Discovery service address handed to new epochs.
    pub discovery_addr: String,

    /// Cluster this workload belongs to.
    pub cluster: String,

    /// Node identity reported in bootstrap artifacts.
    pub node_id: String,

    /// Grace period for a draining epoch before it is force-killed.
    pub drain_grace: Duration,

    /// How long a starting epoch may take to signal readiness.
    pub ready_timeout: Duration,

    /// Initial restart backoff delay.
    pub backoff_base: Duration,

    /// Maximum restart backoff delay.
    pub backoff_max: Duration,

    /// Restart attempts permitted per failure streak.
    pub max_retries: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let proxy_path = std::env::var("MESH_PROXY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/local/bin/mesh-proxy"));

        let config_dir = std::env::var("MESH_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/mesh-agent"));

        let discovery_addr = std::env::var("MESH_DISCOVERY_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:15010".to_string());

        let cluster = std::env::var("MESH_CLUSTER").unwrap_or_else(|_| "default".to_string());

        let node_id = std::env::var("MESH_NODE_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "sidecar".to_string());

        let drain_grace = Duration::from_secs(env_u64("MESH_DRAIN_GRACE_SECS", 45));
        let ready_timeout = Duration::from_secs(env_u64("MESH_READY_TIMEOUT_SECS", 60));
        let backoff_base = Duration::from_millis(env_u64("MESH_BACKOFF_BASE_MS", 200));
        let backoff_max = Duration::from_secs(env_u64("MESH_BACKOFF_MAX_SECS", 30));
        let max_retries = env_u64("MESH_MAX_RETRIES", 10) as u32;

        let log_level = std::env::var("MESH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            proxy_path,
            config_dir,
            discovery_addr,
            cluster,
            node_id,
            drain_grace,
            ready_timeout,
            backoff_base,
            backoff_max,
            max_retries,
            log_level,
        })
    }

    /// Build the retry budget for one failure streak.
    pub fn retry_budget(&self) -> RetryBudget {
        let policy = BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
            ..BackoffPolicy::default()
        };
        RetryBudget::new(policy, self.max_retries)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_defaults() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.discovery_addr, "127.0.0.1:15010");
        assert_eq!(config.drain_grace, Duration::from_secs(45));
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn test_retry_budget_uses_configured_bounds() {
        let config = Config::from_env().unwrap();
        let mut budget = config.retry_budget();
        let first = budget.record_failure().unwrap();
        assert!(first >= config.backoff_base);
    }
}
