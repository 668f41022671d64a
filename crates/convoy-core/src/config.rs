//! Immutable coordinator configuration.
//!
//! Built once at process start and validated before anything else runs. An
//! unsafe election cadence (heartbeat not comfortably inside the lease TTL)
//! is a startup failure, not a runtime warning.

use std::time::Duration;

use convoy_types::{ConflictStrategy, CoordinatorError, CoordinatorResult};

/// Configuration for one coordinator container.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Unique identifier of this container, e.g. `hostname-pid`.
    pub node_id: String,
    /// Logical lock name shared by the fleet.
    pub lock_name: String,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on any single store round trip. Must be shorter than the
    /// TTL so a hung call cannot silently consume a renewal deadline.
    pub store_timeout: Duration,
    pub cache_freshness: Duration,
    pub allow_stale_read_on_fetch_failure: bool,
    pub sync_batch_size: usize,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            lock_name: "sync-leader".to_string(),
            lease_ttl: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            store_timeout: Duration::from_secs(4),
            cache_freshness: Duration::from_secs(30),
            allow_stale_read_on_fetch_failure: true,
            sync_batch_size: 50,
            conflict_strategy: ConflictStrategy::LastWriteWins,
        }
    }
}

impl CoordinatorConfig {
    /// Validate invariants that make the election cadence safe.
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.lease_ttl.is_zero() {
            return Err(CoordinatorError::Config("lease TTL must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(CoordinatorError::Config(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.heartbeat_interval * 2 >= self.lease_ttl {
            return Err(CoordinatorError::Config(format!(
                "heartbeat interval ({:?}) must be less than half the lease TTL ({:?})",
                self.heartbeat_interval, self.lease_ttl
            )));
        }
        if self.store_timeout.is_zero() || self.store_timeout >= self.lease_ttl {
            return Err(CoordinatorError::Config(format!(
                "store timeout ({:?}) must be positive and shorter than the lease TTL ({:?})",
                self.store_timeout, self.lease_ttl
            )));
        }
        if self.sync_batch_size == 0 {
            return Err(CoordinatorError::Config(
                "sync batch size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Stable per-process identifier: `hostname-pid`.
pub fn default_node_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", hostname, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_heartbeat_must_fit_inside_half_ttl() {
        let cfg = CoordinatorConfig {
            lease_ttl: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            store_timeout: Duration::from_secs(2),
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(CoordinatorError::Config(_))
        ));
    }

    #[test]
    fn test_store_timeout_must_be_shorter_than_ttl() {
        let cfg = CoordinatorConfig {
            store_timeout: Duration::from_secs(20),
            ..CoordinatorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let cfg = CoordinatorConfig {
            sync_batch_size: 0,
            ..CoordinatorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
