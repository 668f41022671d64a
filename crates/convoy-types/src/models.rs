//! Domain models for the sync coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Election role of a container, as observed locally.
///
/// `Candidate` exists only inside a single acquisition attempt; it is never
/// durable across heartbeat ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// One row of the lease table. At most one non-expired record exists per
/// `lock_name`; `term` strictly increases on every successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lock_name: String,
    pub holder_id: String,
    /// Fencing term: proves which acquisition is most recent.
    pub term: i64,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Whether the lease is live at the given instant.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Result of a successful acquire-or-renew round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    /// Whether the caller now holds the lease.
    pub granted: bool,
    /// Term under which the lease is (or would be) held.
    pub term: i64,
}

/// Where the authoritative copy of an entity last came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrigin {
    Local,
    Remote,
}

/// One unit of synchronized business state. `version` is the
/// optimistic-concurrency token: a conditional write succeeds only when the
/// stored version matches the writer's expectation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntity {
    pub key: String,
    pub payload: serde_json::Value,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub origin: EntityOrigin,
}

impl SyncEntity {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
            version: 1,
            updated_at: Utc::now(),
            origin: EntityOrigin::Local,
        }
    }
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Later `updated_at` wins; ties broken by the larger version number.
    LastWriteWins,
    /// Caller-registered merge function combines both payloads.
    Merge,
    /// Never auto-resolves; both versions left intact for manual review.
    Escalate,
}

impl ConflictStrategy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriteWins => "last-write-wins",
            Self::Merge => "merge",
            Self::Escalate => "escalate",
        }
    }
}

impl std::str::FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-write-wins" | "last_write_wins" => Ok(Self::LastWriteWins),
            "merge" => Ok(Self::Merge),
            "escalate" => Ok(Self::Escalate),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a conflict resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    Resolved,
    Escalated,
}

impl ConflictOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }
}

/// Append-only audit record for a detected version divergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub key: String,
    pub local_version: i64,
    pub remote_version: i64,
    pub strategy: ConflictStrategy,
    pub outcome: ConflictOutcome,
    pub resolved_at: DateTime<Utc>,
}

/// One cache invalidation event, appended by a writer after a successful
/// store write and consumed by every peer. `seq` is assigned by the store
/// and strictly increases, so a consumer can resume from the last sequence
/// it has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    pub seq: i64,
    pub key: String,
    /// Container that performed the write. Consumers skip their own events;
    /// the writer's cache was already updated in place.
    pub node_id: String,
    pub created_at: DateTime<Utc>,
}

/// What a sync job wants done with its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "payload")]
pub enum JobIntent {
    /// Re-read the remote row and refresh the local cache.
    Refresh,
    /// Write the given payload through to the authoritative store.
    Write(serde_json::Value),
}

/// A pending reconciliation unit. Jobs stay pending until a leader completes
/// them; an abandoned job is picked up again by whichever container leads
/// next, so job execution must be idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub key: String,
    pub intent: JobIntent,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(key: impl Into<String>, intent: JobIntent) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            intent,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lease_liveness() {
        let now = Utc::now();
        let lease = LeaseRecord {
            lock_name: "sync-leader".into(),
            holder_id: "node-a".into(),
            term: 1,
            expires_at: now + Duration::seconds(15),
        };
        assert!(lease.is_live_at(now));
        assert!(!lease.is_live_at(now + Duration::seconds(16)));
    }

    #[test]
    fn test_strategy_round_trip() {
        for s in [
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::Merge,
            ConflictStrategy::Escalate,
        ] {
            assert_eq!(s.as_str().parse::<ConflictStrategy>().unwrap(), s);
        }
        assert!("yolo".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn test_job_intent_serde_shape() {
        let job = SyncJob::new("deploy.acme", JobIntent::Write(serde_json::json!({"v": 1})));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["intent"]["kind"], "write");
        let back: SyncJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
