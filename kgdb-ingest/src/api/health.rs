//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use kgdb_common::db::RunStatus;
use serde::Serialize;

use crate::db::progress;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database does not answer
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Most recent failed source run, as `source: message`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let database_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let last_error = progress::list_all(&state.db)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.status == RunStatus::Failed)
        .max_by_key(|p| p.updated_at)
        .and_then(|p| p.last_error.map(|e| format!("{}: {}", p.source_name, e)));

    Json(HealthResponse {
        status: if database_ok { "ok" } else { "degraded" }.to_string(),
        module: "kgdb-ingest".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        last_error,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
