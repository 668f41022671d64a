//! Deterministic conflict resolution.
//!
//! A conflict is two copies of the same entity with diverged versions: the
//! writer's local copy and the row the authoritative store actually holds.
//! The resolver turns that pair into an audit record plus an instruction for
//! the state manager. Resolution is a pure function of its inputs; no
//! randomness, and wall-clock ties are broken by the version number.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use convoy_types::{ConflictOutcome, ConflictRecord, ConflictStrategy, SyncEntity};

/// Caller-supplied merge function for one entity family. Must be
/// commutative-safe for the payloads it is registered against; the version
/// of the merged row is always greater than both inputs because it is
/// written back through the normal conditional-put path.
pub type MergeFn = Arc<dyn Fn(&SyncEntity, &SyncEntity) -> serde_json::Value + Send + Sync>;

/// What the state manager should do with the diverged pair.
#[derive(Clone)]
pub enum Resolution {
    /// Write this payload back on top of the remote row.
    Apply { payload: serde_json::Value },
    /// The remote row wins; refresh the cache, write nothing.
    KeepRemote,
    /// Leave both versions intact for manual intervention.
    Escalate,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply { .. } => f.write_str("Apply"),
            Self::KeepRemote => f.write_str("KeepRemote"),
            Self::Escalate => f.write_str("Escalate"),
        }
    }
}

/// Strategy dispatcher. One global default strategy; merge functions are
/// registered per key prefix (the segment before the first `.`), mirroring
/// how entity families share a keyspace.
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    merge_fns: HashMap<String, MergeFn>,
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            merge_fns: HashMap::new(),
        }
    }

    /// Register a merge function for all keys under `prefix`.
    pub fn register_merge_fn(&mut self, prefix: impl Into<String>, merge: MergeFn) {
        self.merge_fns.insert(prefix.into(), merge);
    }

    pub const fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Resolve under the configured default strategy.
    pub fn resolve(&self, local: &SyncEntity, remote: &SyncEntity) -> (ConflictRecord, Resolution) {
        self.resolve_with(local, remote, self.default_strategy)
    }

    /// Resolve a divergence between `local` (the writer's copy) and `remote`
    /// (the store's current row) under an explicit strategy.
    pub fn resolve_with(
        &self,
        local: &SyncEntity,
        remote: &SyncEntity,
        strategy: ConflictStrategy,
    ) -> (ConflictRecord, Resolution) {
        let resolution = match strategy {
            ConflictStrategy::LastWriteWins => self.last_write_wins(local, remote),
            ConflictStrategy::Merge => self.merge(local, remote),
            ConflictStrategy::Escalate => Resolution::Escalate,
        };

        let outcome = match resolution {
            Resolution::Escalate => ConflictOutcome::Escalated,
            _ => ConflictOutcome::Resolved,
        };

        let record = ConflictRecord {
            id: Uuid::new_v4(),
            key: local.key.clone(),
            local_version: local.version,
            remote_version: remote.version,
            strategy,
            outcome,
            resolved_at: Utc::now(),
        };

        (record, resolution)
    }

    fn last_write_wins(&self, local: &SyncEntity, remote: &SyncEntity) -> Resolution {
        let local_wins = match local.updated_at.cmp(&remote.updated_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            // Timestamp tie: the larger version number wins.
            std::cmp::Ordering::Equal => local.version > remote.version,
        };

        if local_wins {
            Resolution::Apply {
                payload: local.payload.clone(),
            }
        } else {
            Resolution::KeepRemote
        }
    }

    fn merge(&self, local: &SyncEntity, remote: &SyncEntity) -> Resolution {
        let prefix = local.key.split('.').next().unwrap_or(&local.key);
        match self.merge_fns.get(prefix) {
            Some(merge) => Resolution::Apply {
                payload: merge(local, remote),
            },
            // No merge function registered for this family: fall back to
            // last-write-wins rather than guessing at payload semantics.
            None => self.last_write_wins(local, remote),
        }
    }
}
