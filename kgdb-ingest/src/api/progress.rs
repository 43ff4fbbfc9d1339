//! Per-source run state

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use kgdb_common::db::ProgressState;

use crate::db::progress;
use crate::error::ApiResult;
use crate::progress::ProgressTracker;
use crate::AppState;

/// GET /progress
///
/// Every source that has run at least once.
pub async fn list_progress(State(state): State<AppState>) -> ApiResult<Json<Vec<ProgressState>>> {
    Ok(Json(progress::list_all(&state.db).await?))
}

/// GET /progress/{source}
///
/// A source that never ran reports `idle`.
pub async fn get_progress(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<Json<ProgressState>> {
    let tracker = ProgressTracker::load(state.db.clone(), &source).await?;
    Ok(Json(tracker.state().clone()))
}

/// POST /progress/{source}/reset
///
/// Clears cursor and counters so the next run starts over; 409 while running.
pub async fn reset_progress(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> ApiResult<Json<ProgressState>> {
    let mut tracker = ProgressTracker::load(state.db.clone(), &source).await?;
    tracker.reset().await?;
    Ok(Json(tracker.state().clone()))
}

pub fn progress_routes() -> Router<AppState> {
    Router::new()
        .route("/progress", get(list_progress))
        .route("/progress/:source", get(get_progress))
        .route("/progress/:source/reset", post(reset_progress))
}
