//! What a job actually runs

use async_trait::async_trait;
use kgdb_common::Result;
use tokio_util::sync::CancellationToken;

use crate::config::JobsConfig;
use crate::pipeline::RunStats;
use crate::scoring::RecomputeStats;
use crate::services::IngestServices;

#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn jobs_config(&self) -> Result<JobsConfig>;

    /// Sources an `ingest:all` job covers
    fn source_names(&self) -> Result<Vec<String>>;

    /// Called once before a full-mode run of `source`
    async fn prepare_full_run(&self, source: &str);

    async fn run_source(
        &self,
        source: &str,
        resume: bool,
        cancel: &CancellationToken,
    ) -> Result<RunStats>;

    async fn recompute_scores(&self) -> Result<RecomputeStats>;
}

#[async_trait]
impl JobExecutor for IngestServices {
    fn jobs_config(&self) -> Result<JobsConfig> {
        Ok(self.load_config()?.jobs)
    }

    fn source_names(&self) -> Result<Vec<String>> {
        Ok(self
            .load_config()?
            .enabled_sources()
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn prepare_full_run(&self, source: &str) {
        self.invalidate_source_cache(source).await;
    }

    async fn run_source(
        &self,
        source: &str,
        resume: bool,
        cancel: &CancellationToken,
    ) -> Result<RunStats> {
        IngestServices::run_source(self, source, resume, cancel).await
    }

    async fn recompute_scores(&self) -> Result<RecomputeStats> {
        IngestServices::recompute_scores(self).await
    }
}
