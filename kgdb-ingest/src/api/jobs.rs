//! Job trigger endpoints
//!
//! POST /jobs, GET /jobs, GET /jobs/{id}, POST /jobs/{id}/cancel

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::jobs::{JobArgs, JobInfo, JobQueue};
use crate::AppState;

/// POST /jobs request
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// `ingest:<source>`, `ingest:all` or `score`
    pub job: String,
    #[serde(flatten)]
    pub args: JobArgs,
}

/// POST /jobs response
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

/// POST /jobs
///
/// Returns 202 Accepted with the job id; poll GET /jobs/{id}.
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let job_id = state.jobs.enqueue(&request.job, request.args).await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

/// GET /jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.jobs.list().await)
}

/// GET /jobs/{id}
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobInfo>> {
    Ok(Json(state.jobs.status(id).await?))
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobInfo>> {
    Ok(Json(state.jobs.cancel(id).await?))
}

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(enqueue).get(list_jobs))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/cancel", post(cancel_job))
}
