//! Status, state read, and sync control handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use convoy_core::metrics;
use convoy_core::state::WriteOutcome;
use convoy_types::{
    ConflictRecord, CoordinatorError, JobIntent, LeaseRecord, Role, SyncEntity, SyncJob,
};

use crate::state::AppState;

/// Store errors mapped to HTTP without leaking internals: unreachable store
/// is 503, unknown key is 404, everything else 500.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let status = match &err {
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::FencingRejected { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub role: Role,
    pub term: i64,
    pub node_id: String,
    pub uptime_seconds: u64,
    /// Pending job count, or -1 when the store could not be reached. A
    /// store hiccup must not fail liveness.
    pub queue_size: i64,
}

pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_size = state.queue_size().await.unwrap_or(-1);
    Json(HealthResponse {
        status: "ok",
        role: state.role(),
        term: state.term(),
        node_id: state.node_id().to_string(),
        uptime_seconds: state.uptime_seconds(),
        queue_size,
    })
}

pub async fn get_metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
        .into_response()
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SyncEntity>, ApiError> {
    match state.get_entity(&key).await? {
        Some(entity) => Ok(Json(entity)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("no entity for key: {key}"),
        )),
    }
}

#[derive(Deserialize)]
pub struct PutStateRequest {
    pub payload: serde_json::Value,
    /// Version the caller last observed; 0 creates the key.
    pub expected_version: i64,
}

#[derive(Serialize)]
pub struct PutStateResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictRecord>,
}

/// Direct fenced write under the current leader term. A conflict is a
/// normal 200 response carrying the audit record; only a fencing rejection
/// (not the leader) maps to 409.
pub async fn put_state(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<PutStateRequest>,
) -> Result<Json<PutStateResponse>, ApiError> {
    match state
        .put_entity(&key, req.payload, req.expected_version)
        .await?
    {
        WriteOutcome::Success { new_version } => Ok(Json(PutStateResponse {
            status: "applied",
            new_version: Some(new_version),
            resolved_version: None,
            conflict: None,
        })),
        WriteOutcome::Conflict {
            record,
            resolved_version,
        } => Ok(Json(PutStateResponse {
            status: if resolved_version.is_some() {
                "conflict_resolved"
            } else {
                "conflict_escalated"
            },
            new_version: None,
            resolved_version,
            conflict: Some(record),
        })),
        WriteOutcome::Rejected { reason } => Err(ApiError::new(StatusCode::CONFLICT, reason)),
    }
}

#[derive(Serialize)]
pub struct ClusterStatusResponse {
    pub lock_name: String,
    pub node_id: String,
    pub role: Role,
    pub term: i64,
    /// The lease row as stored, live or expired; None before any election.
    pub lease: Option<LeaseRecord>,
}

/// Fleet-wide view: who holds the lease, under which term, until when.
pub async fn cluster_status(
    State(state): State<AppState>,
) -> Result<Json<ClusterStatusResponse>, ApiError> {
    let lease = state.current_lease().await?;
    Ok(Json(ClusterStatusResponse {
        lock_name: state.lock_name().to_string(),
        node_id: state.node_id().to_string(),
        role: state.role(),
        term: state.term(),
        lease,
    }))
}

#[derive(Deserialize)]
pub struct TriggerRequest {
    pub key: String,
    /// When present the job writes this payload through; otherwise it
    /// refreshes the key from the authoritative store.
    pub payload: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub job_id: Uuid,
    pub fetched: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Enqueue a sync job and drain one batch immediately. Leader only: a
/// follower answers 409 so callers retry against the current leader.
pub async fn trigger_sync(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    if state.role() != Role::Leader {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("not the leader (role {})", state.role()),
        ));
    }

    let intent = match req.payload {
        Some(payload) => JobIntent::Write(payload),
        None => JobIntent::Refresh,
    };
    let job = SyncJob::new(req.key, intent);
    state.enqueue_job(&job).await?;

    let summary = state.drain_now().await;
    Ok(Json(TriggerResponse {
        job_id: job.id,
        fetched: summary.fetched,
        completed: summary.completed,
        failed: summary.failed,
    }))
}

#[derive(Deserialize)]
pub struct ConflictsQuery {
    pub limit: Option<i64>,
}

/// Escalated conflicts awaiting manual review, newest first.
pub async fn list_conflicts(
    State(state): State<AppState>,
    Query(query): Query<ConflictsQuery>,
) -> Result<Json<Vec<ConflictRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let conflicts = state.escalated_conflicts(limit).await?;
    Ok(Json(conflicts))
}
