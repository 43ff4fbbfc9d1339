//! Source and service configuration for tests

use kgdb_ingest::cache::CacheStore;
use kgdb_ingest::config::{
    standard_classification_weights, ConfigSource, ExtractionRule, IngestConfig, JobsConfig,
    RetryPolicy, SourceConfig, SourceKind,
};
use kgdb_ingest::resolver::NomenclatureAuthority;
use kgdb_ingest::services::IngestServices;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Three attempts with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        jitter: 0.0,
        ..RetryPolicy::default()
    }
}

/// Paged count source: `{"results": [{"gene", "pmid", "date"}], "total_pages": n}`
pub fn count_source(base_url: String) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Count,
        base_url,
        requests_per_second: 1_000.0,
        retry: fast_retry(),
        cache_ttl_secs: 0,
        extraction: ExtractionRule {
            items_pointer: "/results".to_string(),
            gene_pointer: "/gene".to_string(),
            count_key_pointer: Some("/pmid".to_string()),
            date_pointer: Some("/date".to_string()),
            page_param: Some("page".to_string()),
            start_page: 1,
            next_pointer: None,
            total_pages_pointer: Some("/total_pages".to_string()),
            ..ExtractionRule::default()
        },
        weight: 1.0,
        ..SourceConfig::default()
    }
}

/// Single-document classification source:
/// `{"results": [{"symbol", "hgnc_id", "classification", "disease"}]}`
pub fn classification_source(base_url: String) -> SourceConfig {
    SourceConfig {
        kind: SourceKind::Classification,
        base_url,
        requests_per_second: 1_000.0,
        retry: fast_retry(),
        cache_ttl_secs: 0,
        extraction: ExtractionRule {
            items_pointer: "/results".to_string(),
            gene_pointer: "/symbol".to_string(),
            hgnc_pointer: Some("/hgnc_id".to_string()),
            classification_pointer: Some("/classification".to_string()),
            label_pointer: Some("/disease".to_string()),
            page_param: None,
            next_pointer: None,
            ..ExtractionRule::default()
        },
        classification_weights: standard_classification_weights(),
        weight: 1.0,
        ..SourceConfig::default()
    }
}

pub fn test_config(sources: Vec<(&str, SourceConfig)>) -> IngestConfig {
    let mut config = IngestConfig {
        sources: sources
            .into_iter()
            .map(|(name, source)| (name.to_string(), source))
            .collect::<BTreeMap<_, _>>(),
        jobs: JobsConfig {
            rate_limit_retry_secs: 0,
            max_job_retries: 1,
            ..JobsConfig::default()
        },
        ..IngestConfig::default()
    };
    config.persist.batch_size = 2;
    config
}

pub fn test_services(
    pool: &SqlitePool,
    config: IngestConfig,
    authority: Arc<dyn NomenclatureAuthority>,
) -> Arc<IngestServices> {
    Arc::new(
        IngestServices::new(
            pool.clone(),
            ConfigSource::Static(config),
            CacheStore::with_sqlite(pool.clone(), 100),
        )
        .with_authority(authority),
    )
}

