//! Ingest service configuration
//!
//! Every per-source knob (rate, retry policy, cache TTL, extraction rule,
//! classification weights, combination weight) lives here and is re-read from
//! the TOML file each time a pipeline set is constructed, so edits take effect
//! on the next job run without a restart.

use kgdb_common::config::{load_toml_or_default, LoggingConfig};
use kgdb_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at the TOML config file
pub const CONFIG_ENV: &str = "KGDB_CONFIG";

/// Config file name looked up inside the root folder when nothing else is given
pub const CONFIG_FILE: &str = "kgdb-ingest.toml";

/// Rate limiter and cache namespace of the nomenclature authority
pub const NOMENCLATURE_NAMESPACE: &str = "nomenclature";

/// Top-level ingest configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Root folder for the database (lowest priority, see `resolve_root_folder`)
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub persist: PersistConfig,
    pub jobs: JobsConfig,
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            http: HttpConfig::default(),
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            persist: PersistConfig::default(),
            jobs: JobsConfig::default(),
            sources: default_sources(),
        }
    }
}

impl IngestConfig {
    /// Reject values that would make a pipeline misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        if self.persist.batch_size == 0 {
            return Err(Error::Config("persist.batch_size must be > 0".to_string()));
        }
        if self.resolver.batch_size == 0 || self.resolver.max_parallel_lookups == 0 {
            return Err(Error::Config(
                "resolver.batch_size and resolver.max_parallel_lookups must be > 0".to_string(),
            ));
        }
        if self.jobs.scoring_chunk_size == 0 || self.jobs.max_parallel_sources == 0 {
            return Err(Error::Config(
                "jobs.scoring_chunk_size and jobs.max_parallel_sources must be > 0".to_string(),
            ));
        }
        self.resolver.retry.validate("resolver")?;

        for (name, source) in &self.sources {
            if name == NOMENCLATURE_NAMESPACE {
                return Err(Error::Config(format!(
                    "sources.{}: name is reserved for the nomenclature authority",
                    name
                )));
            }
            if !(source.requests_per_second > 0.0) {
                return Err(Error::Config(format!(
                    "sources.{}.requests_per_second must be > 0",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&source.weight) {
                return Err(Error::Config(format!(
                    "sources.{}.weight must be within [0, 1]",
                    name
                )));
            }
            for (category, weight) in &source.classification_weights {
                if !(0.0..=1.0).contains(weight) {
                    return Err(Error::Config(format!(
                        "sources.{}.classification_weights.{} must be within [0, 1]",
                        name, category
                    )));
                }
            }
            source.retry.validate(name)?;
        }
        Ok(())
    }

    /// Enabled sources in name order
    pub fn enabled_sources(&self) -> impl Iterator<Item = (&String, &SourceConfig)> {
        self.sources.iter().filter(|(_, source)| source.enabled)
    }
}

/// HTTP listener for the service binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5780".to_string(),
        }
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("kgdb-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry cap of the in-process fallback cache
    pub fallback_capacity: usize,
    /// TTL used when a caller does not supply one
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fallback_capacity: 10_000,
            default_ttl_secs: 86_400,
        }
    }
}

/// Gene identity resolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Search endpoint of the nomenclature authority
    pub nomenclature_url: String,
    pub requests_per_second: f64,
    pub cache_ttl_secs: u64,
    pub retry: RetryPolicy,
    /// Cleaned mentions shorter than this are rejected
    pub min_symbol_length: usize,
    /// Tokens rejected in addition to the built-in denylist
    pub extra_denylist: Vec<String>,
    /// Symbols per batched authority query
    pub batch_size: usize,
    pub max_parallel_lookups: usize,
    /// Authority matches scoring below this are treated as no match
    pub min_authority_score: f64,
    /// Priority added per extra source reporting the same unresolved text
    pub source_agreement_bonus: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            nomenclature_url: "https://rest.genenames.org/search".to_string(),
            requests_per_second: 10.0,
            cache_ttl_secs: 7 * 86_400,
            retry: RetryPolicy::default(),
            min_symbol_length: 2,
            extra_denylist: Vec::new(),
            batch_size: 50,
            max_parallel_lookups: 4,
            min_authority_score: 0.0,
            source_agreement_bonus: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Evidence records written per transaction
    pub batch_size: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// In-process job supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Delay before re-running a job that failed on rate limiting
    pub rate_limit_retry_secs: u64,
    /// Re-runs allowed per job after rate-limit failures
    pub max_job_retries: u32,
    /// Sources run concurrently by `ingest:all`
    pub max_parallel_sources: usize,
    /// Genes written per scoring transaction
    pub scoring_chunk_size: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            rate_limit_retry_secs: 60,
            max_job_retries: 3,
            max_parallel_sources: 4,
            scoring_chunk_size: 500,
        }
    }
}

/// Retry policy of the fetch client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Relative jitter, 0.1 means +/-10%
    pub jitter: f64,
    /// HTTP statuses that are retried; timeouts and connection errors always are
    pub retriable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
            retriable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based).
    ///
    /// `jitter_sample` is a uniform sample in [-1, 1]; the result is
    /// `min(max, initial * multiplier^attempt) * (1 + jitter * sample)`.
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        let factor = 1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0);
        Duration::from_millis((capped * factor).max(0.0).round() as u64)
    }

    pub fn is_retriable_status(&self, status: u16) -> bool {
        self.retriable_statuses.contains(&status)
    }

    fn validate(&self, owner: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(format!("{}: retry.max_attempts must be >= 1", owner)));
        }
        if self.multiplier < 1.0 || !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config(format!(
                "{}: retry.multiplier must be >= 1 and retry.jitter within [0, 1)",
                owner
            )));
        }
        Ok(())
    }
}

/// How a source's evidence is normalized by the scoring engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Raw per-gene counts, normalized by tie-averaged percentile
    Count,
    /// Expert categories, normalized by a weight table
    Classification,
}

/// Per-source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub enabled: bool,
    pub base_url: String,
    /// Static query parameters sent with every request
    pub query: BTreeMap<String, String>,
    pub requests_per_second: f64,
    pub retry: RetryPolicy,
    /// 0 disables response caching for the source
    pub cache_ttl_secs: u64,
    pub extraction: ExtractionRule,
    /// Category -> weight in [0, 1] (classification sources)
    pub classification_weights: BTreeMap<String, f64>,
    /// Contribution of this source to the combined score, in [0, 1]
    pub weight: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Count,
            enabled: true,
            base_url: String::new(),
            query: BTreeMap::new(),
            requests_per_second: 2.0,
            retry: RetryPolicy::default(),
            cache_ttl_secs: 86_400,
            extraction: ExtractionRule::default(),
            classification_weights: BTreeMap::new(),
            weight: 1.0,
        }
    }
}

impl SourceConfig {
    /// Weight of a classification category; unknown categories get the
    /// conservative default
    pub fn classification_weight(&self, category: &str) -> f64 {
        let wanted = category.trim();
        self.classification_weights
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, weight)| *weight)
            .unwrap_or(UNKNOWN_CLASSIFICATION_WEIGHT)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Weight assigned to a classification missing from the lookup table
pub const UNKNOWN_CLASSIFICATION_WEIGHT: f64 = 0.5;

/// Where to find things in a source response.
///
/// All pointers are RFC 6901 JSON pointers; item-level pointers are evaluated
/// against each element of the item list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRule {
    /// Array of items within a page
    pub items_pointer: String,
    /// Gene mention text within an item
    pub gene_pointer: String,
    /// Optional canonical identifier supplied by the source
    pub hgnc_pointer: Option<String>,
    /// Distinct value counted per gene (panel id, term id, publication id)
    pub count_key_pointer: Option<String>,
    /// Pre-aggregated count within an item; used when there is no count key
    pub count_pointer: Option<String>,
    /// Classification category within an item
    pub classification_pointer: Option<String>,
    /// Free-text label kept alongside classifications (disease name)
    pub label_pointer: Option<String>,
    /// Assertion date (`YYYY-MM-DD` prefix)
    pub date_pointer: Option<String>,
    /// Source-supplied numeric score
    pub score_pointer: Option<String>,
    /// Query parameter carrying the page number; `None` means a single request
    pub page_param: Option<String>,
    pub start_page: i64,
    /// Non-null, non-empty value here means another page exists
    pub next_pointer: Option<String>,
    pub total_pages_pointer: Option<String>,
    /// Hard stop for runaway pagination
    pub max_pages: i64,
}

impl Default for ExtractionRule {
    fn default() -> Self {
        Self {
            items_pointer: "/results".to_string(),
            gene_pointer: "/gene_symbol".to_string(),
            hgnc_pointer: None,
            count_key_pointer: None,
            count_pointer: None,
            classification_pointer: None,
            label_pointer: None,
            date_pointer: None,
            score_pointer: None,
            page_param: Some("page".to_string()),
            start_page: 1,
            next_pointer: Some("/next".to_string()),
            total_pages_pointer: None,
            max_pages: 10_000,
        }
    }
}

fn default_sources() -> BTreeMap<String, SourceConfig> {
    let mut sources = BTreeMap::new();

    sources.insert(
        "panelapp".to_string(),
        SourceConfig {
            kind: SourceKind::Count,
            base_url: "https://panelapp.genomicsengland.co.uk/api/v1/genes/".to_string(),
            requests_per_second: 2.0,
            extraction: ExtractionRule {
                gene_pointer: "/gene_data/gene_symbol".to_string(),
                hgnc_pointer: Some("/gene_data/hgnc_id".to_string()),
                count_key_pointer: Some("/panel/id".to_string()),
                ..ExtractionRule::default()
            },
            weight: 1.0,
            ..SourceConfig::default()
        },
    );

    sources.insert(
        "hpo".to_string(),
        SourceConfig {
            kind: SourceKind::Count,
            base_url: "https://ontology.jax.org/api/network/annotation".to_string(),
            requests_per_second: 5.0,
            extraction: ExtractionRule {
                items_pointer: "/genes".to_string(),
                gene_pointer: "/name".to_string(),
                count_key_pointer: Some("/phenotype_id".to_string()),
                page_param: None,
                next_pointer: None,
                ..ExtractionRule::default()
            },
            weight: 0.5,
            ..SourceConfig::default()
        },
    );

    sources.insert(
        "pubtator".to_string(),
        SourceConfig {
            kind: SourceKind::Count,
            base_url: "https://www.ncbi.nlm.nih.gov/research/pubtator3-api/search/".to_string(),
            requests_per_second: 3.0,
            extraction: ExtractionRule {
                gene_pointer: "/gene".to_string(),
                count_key_pointer: Some("/pmid".to_string()),
                date_pointer: Some("/date".to_string()),
                next_pointer: None,
                total_pages_pointer: Some("/total_pages".to_string()),
                ..ExtractionRule::default()
            },
            weight: 0.5,
            ..SourceConfig::default()
        },
    );

    sources.insert(
        "clingen".to_string(),
        SourceConfig {
            kind: SourceKind::Classification,
            base_url: "https://search.clinicalgenome.org/kb/gene-validity".to_string(),
            requests_per_second: 2.0,
            extraction: ExtractionRule {
                items_pointer: "/rows".to_string(),
                gene_pointer: "/symbol".to_string(),
                hgnc_pointer: Some("/hgnc_id".to_string()),
                classification_pointer: Some("/classification".to_string()),
                label_pointer: Some("/disease_name".to_string()),
                date_pointer: Some("/released".to_string()),
                page_param: None,
                next_pointer: None,
                ..ExtractionRule::default()
            },
            classification_weights: standard_classification_weights(),
            weight: 1.0,
            ..SourceConfig::default()
        },
    );

    sources.insert(
        "gencc".to_string(),
        SourceConfig {
            kind: SourceKind::Classification,
            base_url: "https://search.thegencc.org/download/action/submissions-export-json"
                .to_string(),
            requests_per_second: 1.0,
            extraction: ExtractionRule {
                items_pointer: "".to_string(),
                gene_pointer: "/gene_symbol".to_string(),
                hgnc_pointer: Some("/gene_curie".to_string()),
                classification_pointer: Some("/classification_title".to_string()),
                label_pointer: Some("/disease_title".to_string()),
                date_pointer: Some("/submitted_as_date".to_string()),
                page_param: None,
                next_pointer: None,
                ..ExtractionRule::default()
            },
            classification_weights: standard_classification_weights(),
            weight: 0.8,
            ..SourceConfig::default()
        },
    );

    sources
}

/// Gene-disease validity tiers shared by the expert registries
pub fn standard_classification_weights() -> BTreeMap<String, f64> {
    [
        ("Definitive", 1.0),
        ("Strong", 0.8),
        ("Moderate", 0.6),
        ("Supportive", 0.5),
        ("Limited", 0.3),
        ("Disputed", 0.1),
        ("Disputed Evidence", 0.1),
        ("Refuted", 0.0),
        ("Refuted Evidence", 0.0),
        ("No Known Disease Relationship", 0.0),
    ]
    .into_iter()
    .map(|(name, weight)| (name.to_string(), weight))
    .collect()
}

/// Where the configuration comes from.
///
/// `load()` is called whenever a pipeline set is built, which is what makes
/// file edits take effect on the next run.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Static(IngestConfig),
}

impl ConfigSource {
    /// Config file location: explicit path, then `KGDB_CONFIG`, then the root folder
    pub fn locate(cli_path: Option<&Path>, root_folder: &Path) -> Self {
        if let Some(path) = cli_path {
            return ConfigSource::File(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return ConfigSource::File(PathBuf::from(path));
            }
        }
        ConfigSource::File(root_folder.join(CONFIG_FILE))
    }

    pub fn load(&self) -> Result<IngestConfig> {
        let config = match self {
            ConfigSource::File(path) => load_toml_or_default::<IngestConfig>(path)?,
            ConfigSource::Static(config) => config.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4, 0.0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            jitter: 0.2,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0, -1.0), Duration::from_millis(800));
        assert_eq!(policy.delay_for(0, 1.0), Duration::from_millis(1_200));
        // Samples outside [-1, 1] are clamped
        assert_eq!(policy.delay_for(0, 5.0), Duration::from_millis(1_200));
    }

    #[test]
    fn test_unknown_classification_is_conservative() {
        let source = SourceConfig {
            kind: SourceKind::Classification,
            classification_weights: standard_classification_weights(),
            ..SourceConfig::default()
        };
        assert_eq!(source.classification_weight("definitive"), 1.0);
        assert_eq!(source.classification_weight(" Refuted "), 0.0);
        assert_eq!(source.classification_weight("Something New"), 0.5);
    }

    #[test]
    fn test_defaults_validate() {
        let config = IngestConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sources.len(), 5);
        assert_eq!(config.sources["clingen"].kind, SourceKind::Classification);
    }

    #[test]
    fn test_validation_rejects_zero_rate() {
        let mut config = IngestConfig::default();
        config.sources.get_mut("hpo").unwrap().requests_per_second = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_file_edits_are_seen_on_next_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kgdb-ingest.toml");
        std::fs::write(&path, "[sources.hpo]\nkind = \"count\"\nweight = 0.25\n").unwrap();

        let source = ConfigSource::File(path.clone());
        assert_eq!(source.load().unwrap().sources["hpo"].weight, 0.25);

        std::fs::write(&path, "[sources.hpo]\nkind = \"count\"\nweight = 0.75\n").unwrap();
        let reloaded = source.load().unwrap();
        assert_eq!(reloaded.sources["hpo"].weight, 0.75);
        // An explicit [sources] table replaces the default source set
        assert_eq!(reloaded.sources.len(), 1);
    }

    #[test]
    #[serial]
    fn test_env_var_locates_config() {
        std::env::set_var(CONFIG_ENV, "/tmp/kgdb-from-env.toml");
        let located = ConfigSource::locate(None, Path::new("/var/lib/kgdb"));
        std::env::remove_var(CONFIG_ENV);
        assert!(
            matches!(located, ConfigSource::File(ref p) if p == Path::new("/tmp/kgdb-from-env.toml"))
        );

        let located = ConfigSource::locate(None, Path::new("/var/lib/kgdb"));
        assert!(
            matches!(located, ConfigSource::File(ref p) if p == Path::new("/var/lib/kgdb/kgdb-ingest.toml"))
        );
    }
}
