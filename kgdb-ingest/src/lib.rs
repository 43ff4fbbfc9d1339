//! kgdb-ingest library interface
//!
//! Gene-disease evidence ingestion, gene normalization and cross-source
//! scoring. The binary wraps this in an HTTP service; integration tests
//! drive it directly.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod evidence;
pub mod fetch;
pub mod jobs;
pub mod pipeline;
pub mod progress;
pub mod resolver;
pub mod review;
pub mod scoring;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::jobs::JobSupervisor;
use crate::services::IngestServices;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub services: Arc<IngestServices>,
    pub jobs: JobSupervisor,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(services: Arc<IngestServices>) -> Self {
        let jobs = JobSupervisor::new(services.clone());
        Self {
            db: services.pool().clone(),
            services,
            jobs,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::score_routes())
        .merge(api::staging_routes())
        .merge(api::job_routes())
        .merge(api::progress_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
