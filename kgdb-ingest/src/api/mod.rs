//! HTTP API handlers for kgdb-ingest
//!
//! A thin layer over the review, scoring, progress and job interfaces.
//! Authentication is left to whatever fronts the service.

pub mod health;
pub mod jobs;
pub mod progress;
pub mod scores;
pub mod staging;

pub use health::health_routes;
pub use jobs::job_routes;
pub use progress::progress_routes;
pub use scores::score_routes;
pub use staging::staging_routes;

use serde::Deserialize;

/// `?limit=&offset=` paging parameters
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
