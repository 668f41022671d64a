//! In-process store backend.
//!
//! Backs single-node standalone mode and the simulation tests: several
//! `LeaderElector`s sharing one `MemoryLeaseStore` behave like several
//! containers sharing one Postgres. Both stores support fault injection
//! (`set_unavailable`) so tests can simulate the authoritative store
//! becoming unreachable.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

use convoy_types::{
    CacheInvalidation, ConflictOutcome, ConflictRecord, CoordinatorError, CoordinatorResult,
    EntityOrigin, LeaseGrant, LeaseRecord, SyncEntity, SyncJob,
};

use super::{EntityStore, LeaseStore, PutResult};

/// Shared in-memory lease table.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
    unavailable: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (every call fails with a
    /// transient error) or reachable again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> CoordinatorResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::TransientStore(
                "lease store unreachable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire_or_renew(
        &self,
        lock_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CoordinatorResult<LeaseGrant> {
        self.check_available()?;
        let now = Utc::now();
        let mut leases = self.leases.lock();

        match leases.get_mut(lock_name) {
            Some(lease) if lease.is_live_at(now) => {
                if lease.holder_id == holder_id {
                    // Renewal: extend the deadline, keep the term.
                    lease.expires_at = now + ttl;
                    Ok(LeaseGrant {
                        granted: true,
                        term: lease.term,
                    })
                } else {
                    Ok(LeaseGrant {
                        granted: false,
                        term: lease.term,
                    })
                }
            }
            Some(lease) => {
                // Expired lease: take over with the next term.
                lease.holder_id = holder_id.to_string();
                lease.term += 1;
                lease.expires_at = now + ttl;
                Ok(LeaseGrant {
                    granted: true,
                    term: lease.term,
                })
            }
            None => {
                let lease = LeaseRecord {
                    lock_name: lock_name.to_string(),
                    holder_id: holder_id.to_string(),
                    term: 1,
                    expires_at: now + ttl,
                };
                let term = lease.term;
                leases.insert(lock_name.to_string(), lease);
                Ok(LeaseGrant {
                    granted: true,
                    term,
                })
            }
        }
    }

    async fn release_if_held(&self, lock_name: &str, holder_id: &str) -> CoordinatorResult<()> {
        self.check_available()?;
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get_mut(lock_name) {
            if lease.holder_id == holder_id {
                lease.expires_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn current_lease(&self, lock_name: &str) -> CoordinatorResult<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.leases.lock().get(lock_name).cloned())
    }
}

#[derive(Default)]
struct EntityTables {
    entities: HashMap<String, SyncEntity>,
    conflicts: Vec<ConflictRecord>,
    jobs: Vec<SyncJob>,
    invalidations: Vec<CacheInvalidation>,
}

/// Shared in-memory entity table, conflict log, and job queue.
#[derive(Default)]
pub struct MemoryEntityStore {
    tables: Mutex<EntityTables>,
    unavailable: AtomicBool,
    fetches: AtomicU64,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `fetch` round trips served. Lets tests assert that a read
    /// was answered from the local cache without touching the store.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> CoordinatorResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::TransientStore(
                "entity store unreachable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn fetch(&self, key: &str) -> CoordinatorResult<Option<SyncEntity>> {
        self.check_available()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.lock().entities.get(key).cloned())
    }

    async fn conditional_put(
        &self,
        key: &str,
        payload: &serde_json::Value,
        expected_version: i64,
    ) -> CoordinatorResult<PutResult> {
        self.check_available()?;
        let mut tables = self.tables.lock();

        match tables.entities.get_mut(key) {
            Some(entity) => {
                if entity.version == expected_version {
                    entity.payload = payload.clone();
                    entity.version += 1;
                    entity.updated_at = Utc::now();
                    entity.origin = EntityOrigin::Remote;
                    Ok(PutResult::Applied {
                        new_version: entity.version,
                    })
                } else {
                    Ok(PutResult::VersionMismatch {
                        current: entity.clone(),
                    })
                }
            }
            None if expected_version == 0 => {
                let entity = SyncEntity {
                    key: key.to_string(),
                    payload: payload.clone(),
                    version: 1,
                    updated_at: Utc::now(),
                    origin: EntityOrigin::Remote,
                };
                tables.entities.insert(key.to_string(), entity);
                Ok(PutResult::Applied { new_version: 1 })
            }
            None => Err(CoordinatorError::NotFound(key.to_string())),
        }
    }

    async fn record_conflict(&self, record: &ConflictRecord) -> CoordinatorResult<()> {
        self.check_available()?;
        self.tables.lock().conflicts.push(record.clone());
        Ok(())
    }

    async fn list_escalated_conflicts(&self, limit: i64) -> CoordinatorResult<Vec<ConflictRecord>> {
        self.check_available()?;
        let tables = self.tables.lock();
        let mut escalated: Vec<ConflictRecord> = tables
            .conflicts
            .iter()
            .filter(|c| c.outcome == ConflictOutcome::Escalated)
            .cloned()
            .collect();
        escalated.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        escalated.truncate(limit.max(0) as usize);
        Ok(escalated)
    }

    async fn enqueue_job(&self, job: &SyncJob) -> CoordinatorResult<()> {
        self.check_available()?;
        self.tables.lock().jobs.push(job.clone());
        Ok(())
    }

    async fn fetch_pending_jobs(&self, batch: usize) -> CoordinatorResult<Vec<SyncJob>> {
        self.check_available()?;
        let mut tables = self.tables.lock();
        let picked: Vec<Uuid> = tables.jobs.iter().take(batch).map(|j| j.id).collect();
        for job in tables.jobs.iter_mut().filter(|j| picked.contains(&j.id)) {
            job.attempts += 1;
        }
        Ok(tables
            .jobs
            .iter()
            .filter(|j| picked.contains(&j.id))
            .cloned()
            .collect())
    }

    async fn complete_job(&self, id: Uuid) -> CoordinatorResult<()> {
        self.check_available()?;
        self.tables.lock().jobs.retain(|j| j.id != id);
        Ok(())
    }

    async fn pending_job_count(&self) -> CoordinatorResult<i64> {
        self.check_available()?;
        Ok(self.tables.lock().jobs.len() as i64)
    }

    async fn record_invalidation(&self, key: &str, node_id: &str) -> CoordinatorResult<()> {
        self.check_available()?;
        let mut tables = self.tables.lock();
        let seq = tables.invalidations.last().map_or(0, |e| e.seq) + 1;
        tables.invalidations.push(CacheInvalidation {
            seq,
            key: key.to_string(),
            node_id: node_id.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn invalidations_after(
        &self,
        seq: i64,
        limit: i64,
    ) -> CoordinatorResult<Vec<CacheInvalidation>> {
        self.check_available()?;
        Ok(self
            .tables
            .lock()
            .invalidations
            .iter()
            .filter(|e| e.seq > seq)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn latest_invalidation_seq(&self) -> CoordinatorResult<i64> {
        self.check_available()?;
        Ok(self.tables.lock().invalidations.last().map_or(0, |e| e.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::JobIntent;

    #[tokio::test]
    async fn test_lease_acquire_renew_and_takeover() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::seconds(15);

        let a = store.try_acquire_or_renew("sync-leader", "a", ttl).await.unwrap();
        assert!(a.granted);
        assert_eq!(a.term, 1);

        // Renewal keeps the term.
        let a2 = store.try_acquire_or_renew("sync-leader", "a", ttl).await.unwrap();
        assert!(a2.granted);
        assert_eq!(a2.term, 1);

        // Other holder is denied while the lease is live.
        let b = store.try_acquire_or_renew("sync-leader", "b", ttl).await.unwrap();
        assert!(!b.granted);

        // After release, the next acquisition bumps the term.
        store.release_if_held("sync-leader", "a").await.unwrap();
        let b2 = store.try_acquire_or_renew("sync-leader", "b", ttl).await.unwrap();
        assert!(b2.granted);
        assert_eq!(b2.term, 2);
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::seconds(15);
        store.try_acquire_or_renew("sync-leader", "a", ttl).await.unwrap();
        store.release_if_held("sync-leader", "b").await.unwrap();

        let lease = store.current_lease("sync-leader").await.unwrap().unwrap();
        assert!(lease.is_live_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_conditional_put_detects_mismatch() {
        let store = MemoryEntityStore::new();
        let v1 = store
            .conditional_put("k", &serde_json::json!({"n": 1}), 0)
            .await
            .unwrap();
        assert_eq!(v1, PutResult::Applied { new_version: 1 });

        let stale = store
            .conditional_put("k", &serde_json::json!({"n": 2}), 0)
            .await
            .unwrap();
        match stale {
            PutResult::VersionMismatch { current } => assert_eq!(current.version, 1),
            PutResult::Applied { .. } => panic!("stale write must not apply"),
        }
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryLeaseStore::new();
        store.set_unavailable(true);
        let err = store
            .try_acquire_or_renew("sync-leader", "a", Duration::seconds(15))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_pending_jobs_does_not_claim() {
        let store = MemoryEntityStore::new();
        let job = SyncJob::new("k", JobIntent::Refresh);
        store.enqueue_job(&job).await.unwrap();

        let first = store.fetch_pending_jobs(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);

        // Abandoned batch: job is still pending for the next leader.
        let second = store.fetch_pending_jobs(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);

        store.complete_job(job.id).await.unwrap();
        assert_eq!(store.pending_job_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidation_log_sequences_and_resumes() {
        let store = MemoryEntityStore::new();
        assert_eq!(store.latest_invalidation_seq().await.unwrap(), 0);

        store.record_invalidation("a", "node-1").await.unwrap();
        store.record_invalidation("b", "node-1").await.unwrap();
        store.record_invalidation("c", "node-2").await.unwrap();
        assert_eq!(store.latest_invalidation_seq().await.unwrap(), 3);

        // Resuming from a cursor only returns newer events, oldest first.
        let events = store.invalidations_after(1, 10).await.unwrap();
        assert_eq!(
            events.iter().map(|e| (e.seq, e.key.as_str())).collect::<Vec<_>>(),
            vec![(2, "b"), (3, "c")]
        );

        let none = store.invalidations_after(3, 10).await.unwrap();
        assert!(none.is_empty());
    }
}
