//! PostgreSQL store backend.
//!
//! Both synchronization points (lease CAS, entity version CAS) are single
//! conditional statements; the database's transaction isolation is what
//! makes cross-container coordination safe.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use convoy_types::{
    CacheInvalidation, ConflictOutcome, ConflictRecord, ConflictStrategy, CoordinatorError,
    CoordinatorResult, EntityOrigin, LeaseGrant, LeaseRecord, SyncEntity, SyncJob,
};

use super::{EntityStore, LeaseStore, PutResult};

fn map_sqlx_err(err: sqlx::Error) -> CoordinatorError {
    CoordinatorError::TransientStore(err.to_string())
}

/// Create a connection pool sized for a coordinator sidecar, not a web tier.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .idle_timeout(std::time::Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Run database migrations (lease, entity, conflict, and job tables).
pub async fn run_migrations(pool: &PgPool) -> CoordinatorResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| CoordinatorError::TransientStore(err.to_string()))
}

/// Lease table accessor backed by Postgres.
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_acquire_or_renew(
        &self,
        lock_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> CoordinatorResult<LeaseGrant> {
        // Acquire if the lease is absent or expired (term + 1), renew if we
        // already hold it (term unchanged). A live lease held by someone
        // else fails the WHERE clause and affects zero rows.
        let row = sqlx::query(
            r#"INSERT INTO leases (lock_name, holder_id, term, expires_at)
               VALUES ($1, $2, 1, now() + make_interval(secs => $3))
               ON CONFLICT (lock_name) DO UPDATE SET
                   holder_id = EXCLUDED.holder_id,
                   term = CASE
                       WHEN leases.expires_at >= now() AND leases.holder_id = EXCLUDED.holder_id
                           THEN leases.term
                       ELSE leases.term + 1
                   END,
                   expires_at = now() + make_interval(secs => $3)
               WHERE leases.expires_at < now() OR leases.holder_id = EXCLUDED.holder_id
               RETURNING term"#,
        )
        .bind(lock_name)
        .bind(holder_id)
        .bind(ttl.num_milliseconds() as f64 / 1000.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if let Some(row) = row {
            return Ok(LeaseGrant {
                granted: true,
                term: row.get::<i64, _>("term"),
            });
        }

        // Denied: report the incumbent's term for observability.
        let term = sqlx::query("SELECT term FROM leases WHERE lock_name = $1")
            .bind(lock_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .map_or(0, |r| r.get::<i64, _>("term"));

        Ok(LeaseGrant {
            granted: false,
            term,
        })
    }

    async fn release_if_held(&self, lock_name: &str, holder_id: &str) -> CoordinatorResult<()> {
        sqlx::query(
            r#"UPDATE leases SET expires_at = now()
               WHERE lock_name = $1 AND holder_id = $2"#,
        )
        .bind(lock_name)
        .bind(holder_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn current_lease(&self, lock_name: &str) -> CoordinatorResult<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT lock_name, holder_id, term, expires_at FROM leases WHERE lock_name = $1",
        )
        .bind(lock_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.map(|r| LeaseRecord {
            lock_name: r.get("lock_name"),
            holder_id: r.get("holder_id"),
            term: r.get("term"),
            expires_at: r.get("expires_at"),
        }))
    }
}

/// Entity table, conflict log, and job queue backed by Postgres.
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entity_from_row(row: &sqlx::postgres::PgRow) -> SyncEntity {
    SyncEntity {
        key: row.get("key"),
        payload: row.get("payload"),
        version: row.get("version"),
        updated_at: row.get("updated_at"),
        origin: EntityOrigin::Remote,
    }
}

fn conflict_from_row(row: &sqlx::postgres::PgRow) -> CoordinatorResult<ConflictRecord> {
    let strategy: String = row.get("strategy");
    let outcome: String = row.get("outcome");
    Ok(ConflictRecord {
        id: row.get("id"),
        key: row.get("key"),
        local_version: row.get("local_version"),
        remote_version: row.get("remote_version"),
        strategy: strategy
            .parse::<ConflictStrategy>()
            .map_err(CoordinatorError::Config)?,
        outcome: if outcome == "escalated" {
            ConflictOutcome::Escalated
        } else {
            ConflictOutcome::Resolved
        },
        resolved_at: row.get("resolved_at"),
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn fetch(&self, key: &str) -> CoordinatorResult<Option<SyncEntity>> {
        let row = sqlx::query(
            "SELECT key, payload, version, updated_at FROM sync_entities WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(row.as_ref().map(entity_from_row))
    }

    async fn conditional_put(
        &self,
        key: &str,
        payload: &serde_json::Value,
        expected_version: i64,
    ) -> CoordinatorResult<PutResult> {
        let applied = if expected_version == 0 {
            sqlx::query(
                r#"INSERT INTO sync_entities (key, payload, version, updated_at)
                   VALUES ($1, $2, 1, now())
                   ON CONFLICT (key) DO NOTHING
                   RETURNING version"#,
            )
            .bind(key)
            .bind(payload)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
        } else {
            sqlx::query(
                r#"UPDATE sync_entities
                   SET payload = $2, version = version + 1, updated_at = now()
                   WHERE key = $1 AND version = $3
                   RETURNING version"#,
            )
            .bind(key)
            .bind(payload)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
        };

        if let Some(row) = applied {
            return Ok(PutResult::Applied {
                new_version: row.get::<i64, _>("version"),
            });
        }

        // Zero rows affected: re-read the current row for the resolver.
        match self.fetch(key).await? {
            Some(current) => Ok(PutResult::VersionMismatch { current }),
            None => Err(CoordinatorError::NotFound(key.to_string())),
        }
    }

    async fn record_conflict(&self, record: &ConflictRecord) -> CoordinatorResult<()> {
        sqlx::query(
            r#"INSERT INTO conflict_log
               (id, key, local_version, remote_version, strategy, outcome, resolved_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(record.id)
        .bind(&record.key)
        .bind(record.local_version)
        .bind(record.remote_version)
        .bind(record.strategy.as_str())
        .bind(record.outcome.as_str())
        .bind(record.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_escalated_conflicts(&self, limit: i64) -> CoordinatorResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            r#"SELECT id, key, local_version, remote_version, strategy, outcome, resolved_at
               FROM conflict_log
               WHERE outcome = 'escalated'
               ORDER BY resolved_at DESC
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(conflict_from_row).collect()
    }

    async fn enqueue_job(&self, job: &SyncJob) -> CoordinatorResult<()> {
        sqlx::query(
            r#"INSERT INTO sync_jobs (id, key, intent, attempts, created_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(job.id)
        .bind(&job.key)
        .bind(serde_json::to_value(&job.intent)?)
        .bind(job.attempts)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn fetch_pending_jobs(&self, batch: usize) -> CoordinatorResult<Vec<SyncJob>> {
        let rows = sqlx::query(
            r#"UPDATE sync_jobs SET attempts = attempts + 1
               WHERE id IN (
                   SELECT id FROM sync_jobs ORDER BY created_at ASC LIMIT $1
               )
               RETURNING id, key, intent, attempts, created_at"#,
        )
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let intent: serde_json::Value = row.get("intent");
            jobs.push(SyncJob {
                id: row.get("id"),
                key: row.get("key"),
                intent: serde_json::from_value(intent)?,
                attempts: row.get("attempts"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
            });
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn complete_job(&self, id: Uuid) -> CoordinatorResult<()> {
        sqlx::query("DELETE FROM sync_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn pending_job_count(&self) -> CoordinatorResult<i64> {
        let row = sqlx::query("SELECT count(*) AS pending FROM sync_jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.get::<i64, _>("pending"))
    }

    async fn record_invalidation(&self, key: &str, node_id: &str) -> CoordinatorResult<()> {
        sqlx::query("INSERT INTO cache_invalidations (key, node_id) VALUES ($1, $2)")
            .bind(key)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn invalidations_after(
        &self,
        seq: i64,
        limit: i64,
    ) -> CoordinatorResult<Vec<CacheInvalidation>> {
        let rows = sqlx::query(
            r#"SELECT seq, key, node_id, created_at FROM cache_invalidations
               WHERE seq > $1
               ORDER BY seq ASC
               LIMIT $2"#,
        )
        .bind(seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows
            .iter()
            .map(|row| CacheInvalidation {
                seq: row.get("seq"),
                key: row.get("key"),
                node_id: row.get("node_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn latest_invalidation_seq(&self) -> CoordinatorResult<i64> {
        let row = sqlx::query("SELECT coalesce(max(seq), 0) AS seq FROM cache_invalidations")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.get::<i64, _>("seq"))
    }
}
