//! Review queue endpoints

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use kgdb_common::db::{Gene, StagingEntry};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::staging::StagingStats;
use crate::error::ApiResult;
use crate::review::{Approval, DEFAULT_PAGE_SIZE};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StagingQuery {
    /// Only entries this source reported
    pub source: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// POST /staging/{id}/approve request
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub symbol: String,
    pub hgnc_id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub reviewer: String,
    pub notes: Option<String>,
}

/// POST /staging/{id}/reject request
#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reviewer: String,
    pub notes: Option<String>,
}

/// POST /staging/{id}/duplicate request
#[derive(Debug, Deserialize)]
pub struct DuplicateRequest {
    pub gene_id: Uuid,
    pub reviewer: String,
}

/// GET /staging
///
/// Pending entries, highest priority first.
pub async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<StagingQuery>,
) -> ApiResult<Json<Vec<StagingEntry>>> {
    let entries = state
        .services
        .review()
        .list_pending(
            query.source.as_deref(),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(entries))
}

/// GET /staging/stats
pub async fn staging_stats(State(state): State<AppState>) -> ApiResult<Json<StagingStats>> {
    Ok(Json(state.services.review().stats().await?))
}

/// GET /staging/{id}
pub async fn get_staging(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StagingEntry>> {
    Ok(Json(state.services.review().get_staging(id).await?))
}

/// POST /staging/{id}/approve
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Json<Gene>> {
    let approval = Approval {
        symbol: request.symbol,
        hgnc_id: request.hgnc_id,
        aliases: request.aliases,
        reviewer: request.reviewer,
        notes: request.notes,
    };
    Ok(Json(state.services.review().approve(id, approval).await?))
}

/// POST /staging/{id}/reject
pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Json<StagingEntry>> {
    let entry = state
        .services
        .review()
        .reject(id, &request.reviewer, request.notes)
        .await?;
    Ok(Json(entry))
}

/// POST /staging/{id}/duplicate
pub async fn mark_duplicate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<DuplicateRequest>,
) -> ApiResult<Json<Gene>> {
    let gene = state
        .services
        .review()
        .mark_duplicate(id, request.gene_id, &request.reviewer)
        .await?;
    Ok(Json(gene))
}

pub fn staging_routes() -> Router<AppState> {
    Router::new()
        .route("/staging", get(list_pending))
        .route("/staging/stats", get(staging_stats))
        .route("/staging/:id", get(get_staging))
        .route("/staging/:id/approve", post(approve))
        .route("/staging/:id/reject", post(reject))
        .route("/staging/:id/duplicate", post(mark_duplicate))
}
