use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::json;

use convoy_core::EntityStore;
use convoy_types::Role;

use super::status::{
    cluster_status, get_health, get_state, list_conflicts, put_state, trigger_sync,
    ConflictsQuery, PutStateRequest, TriggerRequest,
};
use crate::test_helpers::test_app;

#[tokio::test]
async fn test_health_on_fresh_follower() {
    let app = test_app().await;
    let Json(health) = get_health(State(app.state)).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.role, Role::Follower);
    assert_eq!(health.term, 0);
    assert_eq!(health.node_id, "test-node");
    assert_eq!(health.queue_size, 0);
}

#[tokio::test]
async fn test_health_reports_leadership() {
    let app = test_app().await;
    app.become_leader().await;
    let Json(health) = get_health(State(app.state)).await;
    assert_eq!(health.role, Role::Leader);
    assert_eq!(health.term, 1);
}

#[tokio::test]
async fn test_get_state_unknown_key_is_404() {
    let app = test_app().await;
    let err = get_state(State(app.state), Path("missing".to_string()))
        .await
        .err()
        .unwrap();
    assert_eq!(err.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_state_returns_entity() {
    let app = test_app().await;
    app.store
        .conditional_put("deploy.acme", &json!({"replicas": 3}), 0)
        .await
        .unwrap();

    let Json(entity) = get_state(State(app.state), Path("deploy.acme".to_string()))
        .await
        .unwrap();
    assert_eq!(entity.version, 1);
    assert_eq!(entity.payload, json!({"replicas": 3}));
}

#[tokio::test]
async fn test_trigger_rejected_on_follower() {
    let app = test_app().await;
    let err = trigger_sync(
        State(app.state),
        Json(TriggerRequest {
            key: "deploy.acme".to_string(),
            payload: Some(json!({"replicas": 3})),
        }),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.status(), StatusCode::CONFLICT);
    // The job was never enqueued.
    assert_eq!(app.store.pending_job_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_trigger_writes_through_on_leader() {
    let app = test_app().await;
    app.become_leader().await;

    let Json(resp) = trigger_sync(
        State(app.state),
        Json(TriggerRequest {
            key: "deploy.acme".to_string(),
            payload: Some(json!({"replicas": 3})),
        }),
    )
    .await
    .unwrap();
    assert_eq!(resp.completed, 1);
    assert_eq!(resp.failed, 0);

    let entity = app.store.fetch("deploy.acme").await.unwrap().unwrap();
    assert_eq!(entity.payload, json!({"replicas": 3}));
    assert_eq!(app.store.pending_job_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_put_state_applies_on_leader() {
    let app = test_app().await;
    app.become_leader().await;

    let Json(resp) = put_state(
        State(app.state),
        Path("deploy.acme".to_string()),
        Json(PutStateRequest {
            payload: json!({"replicas": 3}),
            expected_version: 0,
        }),
    )
    .await
    .unwrap();
    assert_eq!(resp.status, "applied");
    assert_eq!(resp.new_version, Some(1));

    let entity = app.store.fetch("deploy.acme").await.unwrap().unwrap();
    assert_eq!(entity.payload, json!({"replicas": 3}));
}

#[tokio::test]
async fn test_put_state_rejected_on_follower() {
    let app = test_app().await;
    let err = put_state(
        State(app.state),
        Path("deploy.acme".to_string()),
        Json(PutStateRequest {
            payload: json!({"replicas": 3}),
            expected_version: 0,
        }),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err.status(), StatusCode::CONFLICT);
    // Nothing was written.
    assert!(app.store.fetch("deploy.acme").await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_state_stale_version_runs_resolution() {
    let app = test_app().await;
    app.become_leader().await;
    app.store
        .conditional_put("deploy.acme", &json!({"replicas": 1}), 0)
        .await
        .unwrap();
    app.store
        .conditional_put("deploy.acme", &json!({"replicas": 2}), 1)
        .await
        .unwrap();

    // Caller last saw version 1; the store is at 2. Last-write-wins
    // reapplies the caller's payload on top of the observed version.
    let Json(resp) = put_state(
        State(app.state),
        Path("deploy.acme".to_string()),
        Json(PutStateRequest {
            payload: json!({"replicas": 5}),
            expected_version: 1,
        }),
    )
    .await
    .unwrap();
    assert_eq!(resp.status, "conflict_resolved");
    assert_eq!(resp.resolved_version, Some(3));
    let record = resp.conflict.unwrap();
    assert_eq!(record.local_version, 1);
    assert_eq!(record.remote_version, 2);
}

#[tokio::test]
async fn test_cluster_status_reports_the_lease() {
    let app = test_app().await;
    app.become_leader().await;

    let Json(status) = cluster_status(State(app.state)).await.unwrap();
    assert_eq!(status.node_id, "test-node");
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.term, 1);

    let lease = status.lease.expect("lease row after acquisition");
    assert_eq!(lease.lock_name, status.lock_name);
    assert_eq!(lease.holder_id, "test-node");
    assert_eq!(lease.term, 1);
}

#[tokio::test]
async fn test_conflicts_empty_by_default() {
    let app = test_app().await;
    let Json(conflicts) = list_conflicts(State(app.state), Query(ConflictsQuery { limit: None }))
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}
