//! Storage abstraction over the authoritative store.
//!
//! Two traits cover the two tables that require cross-process
//! synchronization: the lease table (`LeaseStore`) and the sync entity table
//! plus its conflict log and job queue (`EntityStore`). Both conditional
//! writes are single atomic statements on every backend; there is never a
//! read-then-write across two round trips.

mod memory;
mod postgres;

pub use memory::{MemoryEntityStore, MemoryLeaseStore};
pub use postgres::{connect, run_migrations, PgEntityStore, PgLeaseStore};

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use convoy_types::{
    CacheInvalidation, ConflictRecord, CoordinatorResult, LeaseGrant, LeaseRecord, SyncEntity,
    SyncJob,
};

/// Accessor over the lease table.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically acquire a free/expired lease or renew an owned one.
    ///
    /// Semantics, enforced by a single conditional statement:
    /// - no live lease: create/overwrite with `term = old_term + 1`
    /// - live lease held by `holder_id`: extend `expires_at`, same term
    /// - live lease held by someone else: denied (`granted = false`)
    async fn try_acquire_or_renew(
        &self,
        lock_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CoordinatorResult<LeaseGrant>;

    /// Best-effort early expiry of an owned lease. Shortens failover after a
    /// graceful shutdown; the TTL alone guarantees eventual handover.
    async fn release_if_held(&self, lock_name: &str, holder_id: &str) -> CoordinatorResult<()>;

    /// Read the current lease row, live or not.
    async fn current_lease(&self, lock_name: &str) -> CoordinatorResult<Option<LeaseRecord>>;
}

/// Outcome of a conditional entity write.
#[derive(Debug, Clone, PartialEq)]
pub enum PutResult {
    /// The store's version matched; the row now carries `new_version`.
    Applied { new_version: i64 },
    /// The store's version diverged; `current` is the row as it exists now.
    VersionMismatch { current: SyncEntity },
}

/// Accessor over the sync entity table, conflict log, and job queue.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn fetch(&self, key: &str) -> CoordinatorResult<Option<SyncEntity>>;

    /// Conditional write: succeeds and increments the version only if the
    /// stored version equals `expected_version`. An `expected_version` of
    /// zero creates the row. Zero rows affected signals a conflict and the
    /// current row is re-read for the resolver.
    async fn conditional_put(
        &self,
        key: &str,
        payload: &serde_json::Value,
        expected_version: i64,
    ) -> CoordinatorResult<PutResult>;

    /// Append to the conflict audit log. Records are never mutated.
    async fn record_conflict(&self, record: &ConflictRecord) -> CoordinatorResult<()>;

    /// Escalated conflicts awaiting manual review, newest first.
    async fn list_escalated_conflicts(&self, limit: i64) -> CoordinatorResult<Vec<ConflictRecord>>;

    async fn enqueue_job(&self, job: &SyncJob) -> CoordinatorResult<()>;

    /// Oldest pending jobs, up to `batch`. Fetching does not claim a job:
    /// a job stays pending until `complete_job`, so an abandoned batch is
    /// replayed by the next leader.
    async fn fetch_pending_jobs(&self, batch: usize) -> CoordinatorResult<Vec<SyncJob>>;

    async fn complete_job(&self, id: Uuid) -> CoordinatorResult<()>;

    async fn pending_job_count(&self) -> CoordinatorResult<i64>;

    /// Append a cache invalidation event for `key`. Fan-out to peers is by
    /// polling, like the job queue; there is no push channel.
    async fn record_invalidation(&self, key: &str, node_id: &str) -> CoordinatorResult<()>;

    /// Invalidation events with a sequence greater than `seq`, oldest first.
    async fn invalidations_after(
        &self,
        seq: i64,
        limit: i64,
    ) -> CoordinatorResult<Vec<CacheInvalidation>>;

    /// Highest assigned invalidation sequence, or 0 when the log is empty.
    /// A consumer starts here so it never replays history from before its
    /// own startup.
    async fn latest_invalidation_seq(&self) -> CoordinatorResult<i64>;
}
