//! Score read endpoints
//!
//! GET /scores, GET /scores/{gene_id or symbol}, GET /genes/{gene_id}/evidence

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use kgdb_common::db::{EvidenceRecord, ScoreRecord};
use uuid::Uuid;

use super::PageQuery;
use crate::db::evidence;
use crate::error::{ApiError, ApiResult};
use crate::scoring;
use crate::AppState;

const DEFAULT_LIMIT: i64 = 100;

/// GET /scores
///
/// Highest combined score first.
pub async fn list_scores(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<ScoreRecord>>> {
    let scores = scoring::list_scores(
        &state.db,
        page.limit.unwrap_or(DEFAULT_LIMIT),
        page.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(scores))
}

/// GET /scores/{key}
///
/// `key` is a gene id, or else a symbol or alias.
pub async fn get_score(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<ScoreRecord>> {
    let score = match Uuid::parse_str(&key) {
        Ok(gene_id) => scoring::get_score(&state.db, gene_id).await?,
        Err(_) => scoring::get_score_by_symbol(&state.db, &key).await?,
    };
    score
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No score for {}", key)))
}

/// GET /genes/{gene_id}/evidence
pub async fn gene_evidence(
    State(state): State<AppState>,
    Path(gene_id): Path<Uuid>,
) -> ApiResult<Json<Vec<EvidenceRecord>>> {
    Ok(Json(evidence::list_for_gene(&state.db, gene_id).await?))
}

pub fn score_routes() -> Router<AppState> {
    Router::new()
        .route("/scores", get(list_scores))
        .route("/scores/:key", get(get_score))
        .route("/genes/:gene_id/evidence", get(gene_evidence))
}
