//! Leader-only sync job loop.
//!
//! Only the current leader drains the job queue. Fetching a batch does not
//! claim it: a job is removed from the queue only after it was processed
//! successfully, so a leader dying mid-batch abandons its remaining jobs for
//! whichever container leads next. That makes at-least-once the delivery
//! guarantee, and job execution is written to be idempotent: replaying a
//! completed Write lands on a payload that is already current and becomes a
//! no-op instead of minting a new version.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::timeout;

use convoy_types::{CoordinatorError, CoordinatorResult, JobIntent, Role, SyncJob};

use crate::config::CoordinatorConfig;
use crate::election::ElectionHandle;
use crate::metrics;
use crate::state::{StateManager, WriteOutcome};
use crate::store::EntityStore;

/// What one `drain_batch` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    /// Jobs fetched from the queue.
    pub fetched: usize,
    /// Jobs processed and removed from the queue.
    pub completed: usize,
    /// Jobs left pending because leadership was lost mid-batch.
    pub abandoned: usize,
    /// Jobs that failed and were left pending for a later batch.
    pub failed: usize,
}

pub struct SyncCoordinator {
    store: Arc<dyn EntityStore>,
    state: Arc<StateManager>,
    election: ElectionHandle,
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        state: Arc<StateManager>,
        election: ElectionHandle,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            state,
            election,
            config,
        }
    }

    /// Fetch and process up to one batch of pending jobs. A no-op unless
    /// this container currently leads; the leader check is repeated before
    /// every job so a mid-batch demotion abandons the remainder immediately.
    pub async fn drain_batch(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        if self.election.role() != Role::Leader {
            return summary;
        }

        let jobs = match self
            .with_timeout(self.store.fetch_pending_jobs(self.config.sync_batch_size))
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(error = %err, "failed to fetch pending sync jobs");
                return summary;
            }
        };
        summary.fetched = jobs.len();
        if jobs.is_empty() {
            metrics::set_queue_size(0);
            return summary;
        }

        let total = jobs.len();
        for (idx, job) in jobs.into_iter().enumerate() {
            if self.election.role() != Role::Leader {
                summary.abandoned = total - idx;
                tracing::warn!(
                    node = %self.config.node_id,
                    abandoned = summary.abandoned,
                    "leadership lost mid-batch, abandoning remaining jobs"
                );
                break;
            }

            metrics::set_jobs_active(1);
            let started = Instant::now();
            let job_id = job.id;
            let key = job.key.clone();
            let attempts = job.attempts;

            match self.process_job(job).await {
                Ok(()) => {
                    metrics::record_job_duration("completed", started.elapsed().as_secs_f64());
                    summary.completed += 1;
                    tracing::debug!(%job_id, key, attempts, "sync job completed");
                }
                Err(err) => {
                    // Leave the job pending; a later batch (possibly on
                    // another container) retries it.
                    metrics::record_job_duration("failed", started.elapsed().as_secs_f64());
                    summary.failed += 1;
                    tracing::error!(%job_id, key, attempts, error = %err, "sync job failed");
                }
            }
            metrics::set_jobs_active(0);
        }

        let _ = self.refresh_queue_gauge().await;

        summary
    }

    /// Re-read the pending job count and publish it. Called after every
    /// batch and on every pacing tick while not leading, so the gauge stays
    /// current on followers and after a demotion.
    pub async fn refresh_queue_gauge(&self) -> CoordinatorResult<i64> {
        let pending = self.with_timeout(self.store.pending_job_count()).await?;
        metrics::set_queue_size(pending);
        Ok(pending)
    }

    /// Process one job and, on success, remove it from the queue.
    async fn process_job(&self, job: SyncJob) -> CoordinatorResult<()> {
        let term = self.election.current_term();

        match job.intent {
            JobIntent::Refresh => {
                self.state.get(&job.key).await?;
            }
            JobIntent::Write(payload) => {
                let current = self.state.get(&job.key).await?;
                let already_applied = current
                    .as_ref()
                    .map(|entity| entity.payload == payload)
                    .unwrap_or(false);

                if !already_applied {
                    let expected = current.map(|entity| entity.version).unwrap_or(0);
                    match self.state.put(&job.key, payload, expected, term).await? {
                        WriteOutcome::Success { .. } => {}
                        WriteOutcome::Conflict { record, .. } => {
                            tracing::info!(
                                key = %job.key,
                                outcome = record.outcome.as_str(),
                                "sync job write resolved through conflict path"
                            );
                        }
                        WriteOutcome::Rejected { reason } => {
                            tracing::warn!(key = %job.key, reason, "sync job write fenced off");
                            return Err(CoordinatorError::FencingRejected {
                                write_term: term,
                                current_term: self.election.current_term(),
                            });
                        }
                    }
                }
            }
        }

        self.with_timeout(self.store.complete_job(job.id)).await
    }

    /// Job loop. Parks while a Follower, drains while the Leader, exits when
    /// `shutdown` flips to true. In-flight work is abandoned on shutdown the
    /// same way it is on demotion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut role_rx = self.election.subscribe_role();
        let mut pacing = tokio::time::interval(self.config.heartbeat_interval);
        pacing.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(node = %self.config.node_id, "sync loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.election.role() != Role::Leader {
                tokio::select! {
                    res = role_rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = pacing.tick() => {
                        let _ = self.refresh_queue_gauge().await;
                    }
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let summary = self.drain_batch().await;
            if summary.fetched > 0 {
                tracing::debug!(
                    fetched = summary.fetched,
                    completed = summary.completed,
                    failed = summary.failed,
                    abandoned = summary.abandoned,
                    "sync batch drained"
                );
            }

            tokio::select! {
                _ = pacing.tick() => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!(node = %self.config.node_id, "sync loop stopped");
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
