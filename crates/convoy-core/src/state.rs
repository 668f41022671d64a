//! Cache-aside state manager with fenced write-through.
//!
//! Reads prefer the process-private cache while the entry is fresh, fall
//! back to the authoritative store otherwise, and can serve a stale entry
//! when the store is unreachable (availability over consistency for reads).
//! Writes go to the authoritative store first and update the cache only
//! after the store accepted them; a version mismatch is an expected outcome,
//! surfaced as `WriteOutcome::Conflict`, never as an error.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;

use convoy_types::{
    ConflictOutcome, ConflictRecord, CoordinatorError, CoordinatorResult, EntityOrigin, SyncEntity,
};

use crate::config::CoordinatorConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::election::ElectionHandle;
use crate::metrics;
use crate::store::{EntityStore, PutResult};

/// Result of a fenced write. Conflicts and fencing rejections are ordinary
/// outcomes a caller must handle, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Success {
        new_version: i64,
    },
    /// A version divergence was detected and ran through the resolver.
    /// `resolved_version` is the store's version after resolution, or None
    /// when the conflict was escalated and both versions were left intact.
    Conflict {
        record: ConflictRecord,
        resolved_version: Option<i64>,
    },
    /// The write carried a fencing term that is no longer current. Rejected
    /// locally, before any network call. The caller must re-check its role
    /// and retry the whole operation under the current term.
    Rejected {
        reason: String,
    },
}

/// How often expired entries are swept out of the cache.
const CACHE_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Invalidation events consumed per poll round trip.
const INVALIDATION_BATCH: i64 = 256;

struct CacheEntry {
    entity: SyncEntity,
    cached_at: Instant,
}

pub struct StateManager {
    store: Arc<dyn EntityStore>,
    election: ElectionHandle,
    resolver: ConflictResolver,
    cache: DashMap<String, CacheEntry>,
    config: CoordinatorConfig,
}

impl StateManager {
    pub fn new(
        store: Arc<dyn EntityStore>,
        election: ElectionHandle,
        resolver: ConflictResolver,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            election,
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    /// Cache-aside read. A fresh cache entry is served without I/O;
    /// otherwise the remote row is fetched and the cache repopulated. A
    /// fetch failure with a stale entry present returns the stale entry
    /// (when configured) and bumps the staleness counter.
    pub async fn get(&self, key: &str) -> CoordinatorResult<Option<SyncEntity>> {
        if let Some(entry) = self.cache.get(key) {
            if entry.cached_at.elapsed() < self.config.cache_freshness {
                metrics::record_cache_hit();
                return Ok(Some(entry.entity.clone()));
            }
        }
        metrics::record_cache_miss();

        match self.fetch_remote(key).await {
            Ok(Some(remote)) => {
                self.cache_insert(remote.clone());
                Ok(Some(remote))
            }
            Ok(None) => {
                // Key no longer exists remotely; drop any stale copy.
                self.cache.remove(key);
                Ok(None)
            }
            Err(err) if err.is_transient() && self.config.allow_stale_read_on_fetch_failure => {
                match self.cache.get(key) {
                    Some(entry) => {
                        metrics::record_stale_read();
                        tracing::warn!(key, error = %err, "store fetch failed, serving stale cache entry");
                        Ok(Some(entry.entity.clone()))
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Fenced write-through. `write_term` is the leader term recorded when
    /// the write was scheduled; if it is no longer the current leader term
    /// the write is rejected before any network call.
    pub async fn put(
        &self,
        key: &str,
        payload: serde_json::Value,
        expected_version: i64,
        write_term: i64,
    ) -> CoordinatorResult<WriteOutcome> {
        if !self.election.is_current_leader_term(write_term) {
            let current = self.election.current_term();
            let role = self.election.role();
            tracing::warn!(
                key,
                write_term,
                current_term = current,
                %role,
                "write rejected by fencing check"
            );
            return Ok(WriteOutcome::Rejected {
                reason: format!(
                    "write term {write_term} is not the current leader term {current} (role {role})"
                ),
            });
        }

        let result = self
            .with_timeout(self.store.conditional_put(key, &payload, expected_version))
            .await?;

        match result {
            PutResult::Applied { new_version } => {
                self.cache_insert(SyncEntity {
                    key: key.to_string(),
                    payload,
                    version: new_version,
                    updated_at: Utc::now(),
                    origin: EntityOrigin::Local,
                });
                self.publish_invalidation(key).await;
                Ok(WriteOutcome::Success { new_version })
            }
            PutResult::VersionMismatch { current } => {
                self.resolve_divergence(key, payload, expected_version, current)
                    .await
            }
        }
    }

    /// Run a detected divergence through the resolver and apply its
    /// decision. The cache is only mutated once the store reflects the
    /// resolved state.
    async fn resolve_divergence(
        &self,
        key: &str,
        payload: serde_json::Value,
        expected_version: i64,
        remote: SyncEntity,
    ) -> CoordinatorResult<WriteOutcome> {
        // The local copy is the write happening now.
        let local = SyncEntity {
            key: key.to_string(),
            payload,
            version: expected_version,
            updated_at: Utc::now(),
            origin: EntityOrigin::Local,
        };

        let (mut record, resolution) = self.resolver.resolve(&local, &remote);

        let resolved_version = match resolution {
            Resolution::KeepRemote => {
                self.cache_insert(remote.clone());
                Some(remote.version)
            }
            Resolution::Apply { payload: winning } => {
                // One retry on top of the version we just observed. If that
                // CAS also loses, escalate rather than loop.
                let retry = self
                    .with_timeout(self.store.conditional_put(key, &winning, remote.version))
                    .await;
                match retry {
                    Ok(PutResult::Applied { new_version }) => {
                        self.cache_insert(SyncEntity {
                            key: key.to_string(),
                            payload: winning,
                            version: new_version,
                            updated_at: Utc::now(),
                            origin: EntityOrigin::Local,
                        });
                        self.publish_invalidation(key).await;
                        Some(new_version)
                    }
                    Ok(PutResult::VersionMismatch { .. }) | Err(_) => {
                        record.outcome = ConflictOutcome::Escalated;
                        None
                    }
                }
            }
            Resolution::Escalate => None,
        };

        metrics::record_conflict_resolution(record.strategy.as_str(), record.outcome.as_str());

        // Audit logging must not fail the write that detected the conflict.
        if let Err(err) = self.with_timeout(self.store.record_conflict(&record)).await {
            tracing::error!(key, error = %err, "failed to append conflict record");
        }

        tracing::info!(
            key,
            local_version = record.local_version,
            remote_version = record.remote_version,
            strategy = record.strategy.as_str(),
            outcome = record.outcome.as_str(),
            "version divergence resolved"
        );

        Ok(WriteOutcome::Conflict {
            record,
            resolved_version,
        })
    }

    /// Drop a key from the local cache; the next read goes to the store.
    pub fn invalidate(&self, key: &str) {
        self.cache.remove(key);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Sweep entries older than the freshness window. Returns how many were
    /// evicted; also refreshes the cache-size gauge.
    pub fn evict_expired(&self) -> usize {
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| entry.cached_at.elapsed() < self.config.cache_freshness);
        let after = self.cache.len();
        metrics::set_cache_size(after);
        before - after
    }

    /// Consume peer invalidation events newer than `seq` and drop the
    /// affected keys from the local cache. Events this container produced
    /// are skipped; its cache was already updated in place by the write.
    /// Returns the new resume cursor.
    pub async fn apply_invalidations_after(&self, seq: i64) -> CoordinatorResult<i64> {
        let events = self
            .with_timeout(self.store.invalidations_after(seq, INVALIDATION_BATCH))
            .await?;

        let mut cursor = seq;
        for event in events {
            cursor = cursor.max(event.seq);
            if event.node_id == self.config.node_id {
                continue;
            }
            if self.cache.remove(&event.key).is_some() {
                metrics::record_cache_invalidation();
                tracing::debug!(
                    key = %event.key,
                    writer = %event.node_id,
                    "cache entry dropped after peer write"
                );
            }
        }
        Ok(cursor)
    }

    /// Cache maintenance loop: polls the invalidation log at the heartbeat
    /// cadence and sweeps expired entries once a minute. Runs on every
    /// container regardless of role.
    pub async fn run_cache_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.heartbeat_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_sweep = Instant::now();

        // Start at the log's tail; history from before this process is
        // irrelevant because the cache started empty.
        let mut cursor = match self.with_timeout(self.store.latest_invalidation_seq()).await {
            Ok(seq) => seq,
            Err(err) => {
                tracing::warn!(error = %err, "could not read invalidation cursor, starting at 0");
                0
            }
        };

        tracing::info!(node = %self.config.node_id, cursor, "cache maintenance loop started");

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.apply_invalidations_after(cursor).await {
                        Ok(next) => cursor = next,
                        Err(err) => {
                            tracing::warn!(error = %err, "invalidation poll failed")
                        }
                    }
                    if last_sweep.elapsed() >= CACHE_EVICTION_INTERVAL {
                        let evicted = self.evict_expired();
                        last_sweep = Instant::now();
                        if evicted > 0 {
                            tracing::debug!(evicted, "expired cache entries swept");
                        }
                    }
                    metrics::set_cache_size(self.cache.len());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(node = %self.config.node_id, "cache maintenance loop stopped");
    }

    /// Best-effort: a failed event append never fails the write itself.
    async fn publish_invalidation(&self, key: &str) {
        if let Err(err) = self
            .with_timeout(self.store.record_invalidation(key, &self.config.node_id))
            .await
        {
            tracing::warn!(key, error = %err, "failed to publish cache invalidation");
        }
    }

    fn cache_insert(&self, entity: SyncEntity) {
        self.cache.insert(
            entity.key.clone(),
            CacheEntry {
                entity,
                cached_at: Instant::now(),
            },
        );
    }

    async fn fetch_remote(&self, key: &str) -> CoordinatorResult<Option<SyncEntity>> {
        self.with_timeout(self.store.fetch(key)).await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = CoordinatorResult<T>>,
    ) -> CoordinatorResult<T> {
        timeout(self.config.store_timeout, fut)
            .await
            .map_err(|_| CoordinatorError::TransientStore("store call timed out".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::LeaderElector;
    use crate::store::{MemoryEntityStore, MemoryLeaseStore};
    use convoy_types::{ConflictStrategy, Role};
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        manager: StateManager,
        store: Arc<MemoryEntityStore>,
        elector: LeaderElector,
    }

    async fn leader_rig(config: CoordinatorConfig) -> Rig {
        let lease_store = Arc::new(MemoryLeaseStore::new());
        let elector = LeaderElector::new(lease_store, config.clone());
        elector.tick().await;
        assert_eq!(elector.handle().role(), Role::Leader);

        let store = Arc::new(MemoryEntityStore::new());
        let manager = StateManager::new(
            store.clone(),
            elector.handle(),
            ConflictResolver::new(config.conflict_strategy),
            config,
        );
        Rig {
            manager,
            store,
            elector,
        }
    }

    #[tokio::test]
    async fn test_cache_aside_round_trip() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();

        let outcome = rig
            .manager
            .put("deploy.acme", json!({"replicas": 3}), 0, term)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Success { new_version: 1 });

        let fetches_before = rig.store.fetch_count();
        let entity = rig.manager.get("deploy.acme").await.unwrap().unwrap();
        assert_eq!(entity.version, 1);
        assert_eq!(entity.payload, json!({"replicas": 3}));
        // The put updated the cache in place: the read did no remote I/O.
        assert_eq!(rig.store.fetch_count(), fetches_before);
    }

    #[tokio::test]
    async fn test_put_increments_version() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();

        rig.manager.put("k", json!({"n": 1}), 0, term).await.unwrap();
        let outcome = rig.manager.put("k", json!({"n": 2}), 1, term).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Success { new_version: 2 });
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        rig.store
            .conditional_put("k", &json!({"n": 1}), 0)
            .await
            .unwrap();

        assert!(rig.manager.get("k").await.unwrap().is_some());
        assert_eq!(rig.store.fetch_count(), 1);

        // Fresh entry: second read is served locally.
        assert!(rig.manager.get("k").await.unwrap().is_some());
        assert_eq!(rig.store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_when_store_unreachable() {
        let config = CoordinatorConfig {
            cache_freshness: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        let rig = leader_rig(config).await;
        rig.store
            .conditional_put("k", &json!({"n": 1}), 0)
            .await
            .unwrap();

        // Populate the (immediately stale) cache, then cut the store off.
        rig.manager.get("k").await.unwrap();
        rig.store.set_unavailable(true);

        let entity = rig.manager.get("k").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache_propagates() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        rig.store.set_unavailable(true);

        let err = rig.manager.get("missing").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stale_fallback_can_be_disabled() {
        let config = CoordinatorConfig {
            cache_freshness: Duration::ZERO,
            allow_stale_read_on_fetch_failure: false,
            ..CoordinatorConfig::default()
        };
        let rig = leader_rig(config).await;
        rig.store
            .conditional_put("k", &json!({"n": 1}), 0)
            .await
            .unwrap();
        rig.manager.get("k").await.unwrap();
        rig.store.set_unavailable(true);

        assert!(rig.manager.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_stale_term_rejected_before_any_network_call() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();

        rig.store.set_unavailable(true);
        let outcome = rig
            .manager
            .put("k", json!({"n": 1}), 0, term + 1)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Rejected { .. }));

        // A current-term write with the store down is a transient error,
        // proving the fencing rejection happened without touching the store.
        assert!(rig.manager.put("k", json!({"n": 1}), 0, term).await.is_err());
    }

    #[tokio::test]
    async fn test_follower_writes_rejected() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();
        rig.elector.release().await;

        let outcome = rig.manager.put("k", json!({"n": 1}), 0, term).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_write_conflict_creates_record() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();

        // Bring the row to version 5 and cache it.
        rig.store
            .conditional_put("x", &json!({"n": 0}), 0)
            .await
            .unwrap();
        for v in 1..5 {
            rig.store
                .conditional_put("x", &json!({"n": v}), v)
                .await
                .unwrap();
        }
        rig.manager.invalidate("x");
        assert_eq!(rig.manager.get("x").await.unwrap().unwrap().version, 5);

        // Another writer got there first: the store is now at version 6.
        rig.store
            .conditional_put("x", &json!({"n": "other"}), 5)
            .await
            .unwrap();

        let outcome = rig
            .manager
            .put("x", json!({"n": "mine"}), 5, term)
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Conflict {
                record,
                resolved_version,
            } => {
                assert_eq!(record.local_version, 5);
                assert_eq!(record.remote_version, 6);
                assert_eq!(record.outcome, ConflictOutcome::Resolved);
                // Last-write-wins: this write is the most recent, so it was
                // reapplied on top of the observed remote version.
                assert_eq!(resolved_version, Some(7));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The cache reflects the resolved row.
        let entity = rig.manager.get("x").await.unwrap().unwrap();
        assert_eq!(entity.version, 7);
        assert_eq!(entity.payload, json!({"n": "mine"}));
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted() {
        let config = CoordinatorConfig {
            cache_freshness: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        let rig = leader_rig(config).await;
        rig.store
            .conditional_put("k", &json!({"n": 1}), 0)
            .await
            .unwrap();

        rig.manager.get("k").await.unwrap();
        assert_eq!(rig.manager.cached_len(), 1);

        assert_eq!(rig.manager.evict_expired(), 1);
        assert_eq!(rig.manager.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_fresh_entries_survive_eviction() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        rig.store
            .conditional_put("k", &json!({"n": 1}), 0)
            .await
            .unwrap();
        rig.manager.get("k").await.unwrap();

        assert_eq!(rig.manager.evict_expired(), 0);
        assert_eq!(rig.manager.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_peer_write_drops_cached_entry() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();

        // A follower on another container shares the entity store.
        let peer_config = CoordinatorConfig {
            node_id: "node-peer".to_string(),
            ..CoordinatorConfig::default()
        };
        let peer_elector =
            LeaderElector::new(Arc::new(MemoryLeaseStore::new()), peer_config.clone());
        let peer = StateManager::new(
            rig.store.clone(),
            peer_elector.handle(),
            ConflictResolver::new(peer_config.conflict_strategy),
            peer_config,
        );

        rig.manager.put("k", json!({"n": 1}), 0, term).await.unwrap();
        assert_eq!(peer.get("k").await.unwrap().unwrap().version, 1);

        // The leader writes again; the peer's fresh cache entry is now
        // stale but still served.
        rig.manager.put("k", json!({"n": 2}), 1, term).await.unwrap();
        assert_eq!(peer.get("k").await.unwrap().unwrap().version, 1);

        // Consuming the invalidation log drops the entry; the next read
        // goes back to the store and sees the new version.
        let cursor = peer.apply_invalidations_after(0).await.unwrap();
        assert_eq!(cursor, 2);
        assert_eq!(peer.cached_len(), 0);
        assert_eq!(peer.get("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_own_invalidations_are_skipped() {
        let rig = leader_rig(CoordinatorConfig::default()).await;
        let term = rig.elector.handle().current_term();

        rig.manager.put("k", json!({"n": 1}), 0, term).await.unwrap();
        assert_eq!(rig.manager.cached_len(), 1);

        // The writer's own event must not evict the entry it just cached.
        rig.manager.apply_invalidations_after(0).await.unwrap();
        assert_eq!(rig.manager.cached_len(), 1);

        let fetches_before = rig.store.fetch_count();
        assert_eq!(rig.manager.get("k").await.unwrap().unwrap().version, 1);
        assert_eq!(rig.store.fetch_count(), fetches_before);
    }

    #[tokio::test]
    async fn test_escalate_strategy_leaves_store_untouched() {
        let config = CoordinatorConfig {
            conflict_strategy: ConflictStrategy::Escalate,
            ..CoordinatorConfig::default()
        };
        let rig = leader_rig(config).await;
        let term = rig.elector.handle().current_term();

        rig.store
            .conditional_put("x", &json!({"n": 1}), 0)
            .await
            .unwrap();
        rig.store
            .conditional_put("x", &json!({"n": 2}), 1)
            .await
            .unwrap();

        let outcome = rig.manager.put("x", json!({"n": "mine"}), 1, term).await.unwrap();
        match outcome {
            WriteOutcome::Conflict {
                record,
                resolved_version,
            } => {
                assert_eq!(record.outcome, ConflictOutcome::Escalated);
                assert_eq!(resolved_version, None);
            }
            other => panic!("expected escalated conflict, got {other:?}"),
        }

        // Both versions intact: store still at version 2 with its payload.
        let remote = rig.store.fetch("x").await.unwrap().unwrap();
        assert_eq!(remote.version, 2);
        assert_eq!(remote.payload, json!({"n": 2}));

        // Escalated conflicts are queryable for manual review.
        let escalated = rig.store.list_escalated_conflicts(10).await.unwrap();
        assert_eq!(escalated.len(), 1);
    }
}
