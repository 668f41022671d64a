//! API Routes
//!
//! REST endpoints for state reads, manual sync triggering, and conflict
//! review. Liveness and metrics are mounted at the root by `main`.

mod status;

#[cfg(test)]
mod status_tests;

use axum::routing::{get, post, put};
use axum::Router;

use crate::state::AppState;

pub use status::{get_health, get_metrics};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/state/:key", get(status::get_state))
        .route("/state/:key", put(status::put_state))
        .route("/cluster/status", get(status::cluster_status))
        .route("/sync/trigger", post(status::trigger_sync))
        .route("/conflicts", get(status::list_conflicts))
}
