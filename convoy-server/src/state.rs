//! Application State
//!
//! Shared state for the status API: read handles onto the election, the
//! state manager, and the job queue.

use std::sync::Arc;
use std::time::Instant;

use convoy_core::config::CoordinatorConfig;
use convoy_core::coordinator::SyncCoordinator;
use convoy_core::election::ElectionHandle;
use convoy_core::state::{StateManager, WriteOutcome};
use convoy_core::store::{EntityStore, LeaseStore};
use convoy_types::{
    ConflictRecord, CoordinatorResult, LeaseRecord, Role, SyncEntity, SyncJob,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: CoordinatorConfig,
    pub election: ElectionHandle,
    pub manager: Arc<StateManager>,
    pub coordinator: Arc<SyncCoordinator>,
    pub store: Arc<dyn EntityStore>,
    pub lease_store: Arc<dyn LeaseStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: CoordinatorConfig,
        election: ElectionHandle,
        manager: Arc<StateManager>,
        coordinator: Arc<SyncCoordinator>,
        store: Arc<dyn EntityStore>,
        lease_store: Arc<dyn LeaseStore>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                election,
                manager,
                coordinator,
                store,
                lease_store,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn role(&self) -> Role {
        self.inner.election.role()
    }

    pub fn term(&self) -> i64 {
        self.inner.election.current_term()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    pub async fn queue_size(&self) -> CoordinatorResult<i64> {
        self.inner.store.pending_job_count().await
    }

    pub async fn get_entity(&self, key: &str) -> CoordinatorResult<Option<SyncEntity>> {
        self.inner.manager.get(key).await
    }

    /// Fenced write under the current leader term. A follower's attempt
    /// comes back as `WriteOutcome::Rejected`.
    pub async fn put_entity(
        &self,
        key: &str,
        payload: serde_json::Value,
        expected_version: i64,
    ) -> CoordinatorResult<WriteOutcome> {
        let term = self.inner.election.current_term();
        self.inner.manager.put(key, payload, expected_version, term).await
    }

    pub fn lock_name(&self) -> &str {
        &self.inner.config.lock_name
    }

    pub async fn current_lease(&self) -> CoordinatorResult<Option<LeaseRecord>> {
        self.inner.lease_store.current_lease(&self.inner.config.lock_name).await
    }

    pub async fn enqueue_job(&self, job: &SyncJob) -> CoordinatorResult<()> {
        self.inner.store.enqueue_job(job).await
    }

    /// Drain one batch immediately instead of waiting for the next pacing
    /// tick. A no-op unless this container leads.
    pub async fn drain_now(&self) -> convoy_core::coordinator::BatchSummary {
        self.inner.coordinator.drain_batch().await
    }

    pub async fn escalated_conflicts(&self, limit: i64) -> CoordinatorResult<Vec<ConflictRecord>> {
        self.inner.store.list_escalated_conflicts(limit).await
    }
}
