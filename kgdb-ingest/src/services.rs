//! Process-wide wiring between configuration and the ingestion core
//!
//! Configuration is re-read when a job starts, so edits to source settings
//! apply to the next run without a restart. Long-lived state (cache, rate
//! limiters, symbol locks) is shared across runs.

use kgdb_common::{Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::{ConfigSource, IngestConfig, NOMENCLATURE_NAMESPACE};
use crate::fetch::{build_http_client, FetchClient, RateLimiterRegistry};
use crate::pipeline::{run_pipeline, PipelineContext, PipelineRegistry, RunStats};
use crate::resolver::{GeneResolver, HgncClient, KeyedLocks, NomenclatureAuthority};
use crate::review::ReviewService;
use crate::scoring::{RecomputeStats, ScoringEngine};

pub struct IngestServices {
    pool: SqlitePool,
    config_source: ConfigSource,
    cache: CacheStore,
    limiters: RateLimiterRegistry,
    locks: KeyedLocks,
    scoring_lock: Arc<Mutex<()>>,
    authority: Option<Arc<dyn NomenclatureAuthority>>,
}

impl IngestServices {
    pub fn new(pool: SqlitePool, config_source: ConfigSource, cache: CacheStore) -> Self {
        Self {
            pool,
            config_source,
            cache,
            limiters: RateLimiterRegistry::new(),
            locks: KeyedLocks::new(),
            scoring_lock: Arc::new(Mutex::new(())),
            authority: None,
        }
    }

    /// Use `authority` instead of the HTTP nomenclature client
    pub fn with_authority(mut self, authority: Arc<dyn NomenclatureAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn load_config(&self) -> Result<IngestConfig> {
        self.config_source.load()
    }

    pub fn review(&self) -> ReviewService {
        ReviewService::new(self.pool.clone(), self.locks.clone())
    }

    fn authority(
        &self,
        config: &IngestConfig,
        http: &reqwest::Client,
    ) -> Result<Arc<dyn NomenclatureAuthority>> {
        if let Some(authority) = &self.authority {
            return Ok(authority.clone());
        }
        let resolver = &config.resolver;
        let fetch = FetchClient::new(
            NOMENCLATURE_NAMESPACE,
            http.clone(),
            self.limiters
                .limiter_for(NOMENCLATURE_NAMESPACE, resolver.requests_per_second)?,
            resolver.retry.clone(),
            self.cache.clone(),
            Duration::from_secs(resolver.cache_ttl_secs),
        );
        Ok(Arc::new(HgncClient::new(
            fetch,
            resolver.nomenclature_url.clone(),
            resolver.min_authority_score,
        )))
    }

    /// One pipeline per enabled source, all sharing one resolver
    pub fn build_pipelines(&self, config: &IngestConfig) -> Result<PipelineRegistry> {
        let http = build_http_client(&config.http)?;
        let resolver = Arc::new(GeneResolver::new(
            self.pool.clone(),
            self.authority(config, &http)?,
            self.locks.clone(),
            &config.resolver,
        ));

        let contexts = config
            .enabled_sources()
            .map(|(name, source)| {
                let fetch = FetchClient::new(
                    name.clone(),
                    http.clone(),
                    self.limiters.limiter_for(name, source.requests_per_second)?,
                    source.retry.clone(),
                    self.cache.clone(),
                    source.cache_ttl(),
                );
                Ok(PipelineContext {
                    name: name.clone(),
                    source: source.clone(),
                    pool: self.pool.clone(),
                    fetch,
                    resolver: resolver.clone(),
                    persist_batch_size: config.persist.batch_size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        PipelineRegistry::from_contexts(contexts)
    }

    /// Run one enabled source
    pub async fn run_source(
        &self,
        name: &str,
        resume: bool,
        cancel: &CancellationToken,
    ) -> Result<RunStats> {
        let config = self.load_config()?;
        let registry = self.build_pipelines(&config)?;
        let pipeline = registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Source {} is unknown or disabled", name)))?;
        run_pipeline(pipeline.as_ref(), resume, cancel).await
    }

    /// Drop every cached response of `source` so the next run refetches
    pub async fn invalidate_source_cache(&self, source: &str) -> u64 {
        let removed = self.cache.invalidate(&format!("{}:*", source)).await;
        info!(source, removed, "Source cache cleared");
        removed
    }

    pub async fn recompute_scores(&self) -> Result<RecomputeStats> {
        let config = self.load_config()?;
        ScoringEngine::new(
            self.pool.clone(),
            config.sources,
            config.jobs.scoring_chunk_size,
        )
        .with_lock(self.scoring_lock.clone())
        .recompute_all()
        .await
    }
}
