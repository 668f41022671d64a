//! Lease-based leader election with fencing terms.
//!
//! Every container runs one `LeaderElector`. Each heartbeat tick performs a
//! single atomic acquire-or-renew against the lease table; the container
//! holding a live lease is the Leader, everyone else sits hot as a Follower.
//! The strictly increasing lease term doubles as a fencing token: a stale
//! leader resuming after a partition presents an old term and is rejected by
//! the state manager's write path.
//!
//! Fail-safe bias: a store that cannot be reached counts as a failed
//! renewal. Losing leadership unnecessarily is always preferred over two
//! containers believing they lead at once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;

use convoy_types::Role;

use crate::config::CoordinatorConfig;
use crate::metrics;
use crate::store::LeaseStore;

/// Renewal failures tolerated before a Leader demotes itself, well before
/// the TTL would lapse on its own.
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Process-local election state. Owned by the elector, rebuilt from the
/// lease row on every heartbeat tick, protected by a single mutex so
/// transitions are totally ordered within the process.
#[derive(Debug, Clone, Copy)]
struct ElectionState {
    role: Role,
    term: i64,
    lease_deadline: Option<DateTime<Utc>>,
}

struct HandleInner {
    state: Mutex<ElectionState>,
    role_tx: watch::Sender<Role>,
}

/// Cheap, cloneable read handle onto the election state. The state manager
/// uses it for fencing checks; the sync loop subscribes to role changes
/// through it.
#[derive(Clone)]
pub struct ElectionHandle {
    inner: Arc<HandleInner>,
}

impl ElectionHandle {
    fn new() -> Self {
        let (role_tx, _) = watch::channel(Role::Follower);
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(ElectionState {
                    role: Role::Follower,
                    term: 0,
                    lease_deadline: None,
                }),
                role_tx,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.state.lock().role
    }

    pub fn current_term(&self) -> i64 {
        self.inner.state.lock().term
    }

    pub fn lease_deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().lease_deadline
    }

    /// True only while this container may write: Leader role under `term`.
    pub fn is_current_leader_term(&self, term: i64) -> bool {
        let state = self.inner.state.lock();
        state.role == Role::Leader && state.term == term
    }

    /// Subscribe to durable role transitions (Leader/Follower). The
    /// transient Candidate state lives only inside a single acquisition
    /// attempt and is observable through `role()`, never on the channel, so
    /// a follower's failed attempts do not wake subscribers every tick.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.inner.role_tx.subscribe()
    }

    fn set(&self, role: Role, term: i64, lease_deadline: Option<DateTime<Utc>>) {
        {
            let mut state = self.inner.state.lock();
            state.role = role;
            state.term = term;
            state.lease_deadline = lease_deadline;
        }
        if role == Role::Candidate {
            return;
        }
        self.inner.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
    }
}

/// Runs the heartbeat loop for one container.
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: CoordinatorConfig,
    handle: ElectionHandle,
    consecutive_failures: AtomicU32,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LeaseStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            handle: ElectionHandle::new(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> ElectionHandle {
        self.handle.clone()
    }

    /// One heartbeat attempt: acquire or renew the lease, update the local
    /// election state, and return the resulting role.
    ///
    /// Never returns an error; every failure mode degrades toward Follower
    /// and the loop keeps retrying.
    pub async fn tick(&self) -> Role {
        let was = self.handle.role();
        if was == Role::Follower {
            // Candidate only lives for the duration of this attempt.
            self.handle.set(Role::Candidate, self.handle.current_term(), None);
        }

        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(15));
        let attempt = timeout(
            self.config.store_timeout,
            self.store
                .try_acquire_or_renew(&self.config.lock_name, &self.config.node_id, ttl),
        )
        .await;

        match attempt {
            Ok(Ok(grant)) if grant.granted => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let deadline = Utc::now() + ttl;
                self.handle.set(Role::Leader, grant.term, Some(deadline));
                metrics::set_lease_expiry(deadline.timestamp());

                if was == Role::Leader {
                    metrics::record_transition("renewed");
                    tracing::debug!(
                        node = %self.config.node_id,
                        term = grant.term,
                        "lease renewed"
                    );
                } else {
                    metrics::record_transition("acquired");
                    tracing::info!(
                        node = %self.config.node_id,
                        term = grant.term,
                        "became leader"
                    );
                }
                Role::Leader
            }
            Ok(Ok(grant)) => {
                // A live lease is held elsewhere. If we thought we led, our
                // term has been superseded: step down at once.
                if was == Role::Leader {
                    metrics::record_transition("lost");
                    tracing::warn!(
                        node = %self.config.node_id,
                        incumbent_term = grant.term,
                        "leadership taken over, demoting"
                    );
                }
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.handle.set(Role::Follower, grant.term, None);
                Role::Follower
            }
            Ok(Err(err)) => self.on_renewal_failure(was, &err.to_string()),
            Err(_elapsed) => self.on_renewal_failure(was, "store call timed out"),
        }
    }

    /// A store error or timeout during the attempt. Treated as a renewal
    /// failure: a Leader gets a bounded number of strikes, a Follower simply
    /// stays a Follower.
    fn on_renewal_failure(&self, was: Role, reason: &str) -> Role {
        metrics::record_heartbeat_failure();

        if was == Role::Leader {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= MAX_RENEWAL_FAILURES {
                metrics::record_transition("demoted");
                tracing::warn!(
                    node = %self.config.node_id,
                    failures,
                    reason,
                    "renewals failing, demoting before TTL expiry"
                );
                self.handle
                    .set(Role::Follower, self.handle.current_term(), None);
                return Role::Follower;
            }
            tracing::warn!(
                node = %self.config.node_id,
                failures,
                reason,
                "lease renewal failed, still within grace"
            );
            return Role::Leader;
        }

        tracing::warn!(node = %self.config.node_id, reason, "lease acquisition failed");
        self.handle
            .set(Role::Follower, self.handle.current_term(), None);
        Role::Follower
    }

    /// Heartbeat loop. Runs until `shutdown` flips to true, then performs
    /// one best-effort lease release so a peer can take over without waiting
    /// for the TTL.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // Containers started at the same instant would otherwise race the
        // first acquisition on every deploy; jitter spreads them out.
        let max_jitter = self.config.heartbeat_interval / 2;
        if !max_jitter.is_zero() {
            let jitter = rand::thread_rng().gen_range(std::time::Duration::ZERO..max_jitter);
            tokio::time::sleep(jitter).await;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            node = %self.config.node_id,
            lock = %self.config.lock_name,
            "election loop started"
        );

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.release().await;
        tracing::info!(node = %self.config.node_id, "election loop stopped");
    }

    /// Best-effort release, bounded by the store timeout. Not required for
    /// correctness; the TTL alone guarantees eventual handover.
    pub async fn release(&self) {
        let was_leader = self.handle.role() == Role::Leader;
        let result = timeout(
            self.config.store_timeout,
            self.store
                .release_if_held(&self.config.lock_name, &self.config.node_id),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                if was_leader {
                    metrics::record_transition("released");
                    tracing::info!(node = %self.config.node_id, "lease released");
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(node = %self.config.node_id, error = %err, "lease release failed")
            }
            Err(_) => {
                tracing::warn!(node = %self.config.node_id, "lease release timed out")
            }
        }

        self.handle
            .set(Role::Follower, self.handle.current_term(), None);
    }
}
