//! Evidence scoring
//!
//! Count sources are normalized per source by tie-averaged percentile rank
//! over the genes that source reports; classification sources map each
//! category to a weight. The combined score is
//!
//! ```text
//! 100 * sum(source_weight * normalized_value) / active_sources
//! ```
//!
//! where `active_sources` counts the enabled sources that currently have any
//! evidence. Dividing by the system-wide source count (not the gene's own)
//! keeps a gene with one strong source from outranking a gene with several.
//!
//! Scores are fully derived: every recompute rebuilds them from the evidence
//! table and is deterministic for an unchanged evidence set.

pub mod percentile;

pub use percentile::percentile_ranks;

use chrono::Utc;
use kgdb_common::db::{EvidenceRecord, ScoreRecord};
use kgdb_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{SourceConfig, SourceKind, UNKNOWN_CLASSIFICATION_WEIGHT};
use crate::db::{evidence, genes, scores};
use crate::pipeline::classification_source::payload_classifications;
use crate::pipeline::count_source::payload_count;

/// Raw per-source observations collected from evidence records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceMatrix {
    /// source -> gene -> raw value (count, or best category weight)
    by_source: BTreeMap<String, BTreeMap<Uuid, f64>>,
    /// gene -> evidence items (counted keys, reported categories)
    items: BTreeMap<Uuid, i64>,
}

impl EvidenceMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record; records of unknown or disabled sources are ignored.
    /// Returns whether the record was used.
    pub fn add(&mut self, record: &EvidenceRecord, sources: &BTreeMap<String, SourceConfig>) -> bool {
        let Some(source) = sources.get(&record.source_name).filter(|s| s.enabled) else {
            return false;
        };

        let (raw, items) = match source.kind {
            SourceKind::Count => {
                let count = payload_count(&record.payload)
                    .or(record.source_score)
                    .unwrap_or(0.0)
                    .max(0.0);
                (count, count.round() as i64)
            }
            SourceKind::Classification => {
                let categories = payload_classifications(&record.payload);
                let weight = categories
                    .iter()
                    .map(|c| source.classification_weight(c))
                    .fold(None, |best: Option<f64>, w| Some(best.map_or(w, |b| b.max(w))))
                    .or(record.source_score)
                    .unwrap_or(UNKNOWN_CLASSIFICATION_WEIGHT)
                    .clamp(0.0, 1.0);
                (weight, categories.len().max(1) as i64)
            }
        };

        self.by_source
            .entry(record.source_name.clone())
            .or_default()
            .insert(record.gene_id, raw);
        *self.items.entry(record.gene_id).or_default() += items;
        true
    }

    /// Sources with at least one gene
    pub fn active_sources(&self) -> usize {
        self.by_source.values().filter(|genes| !genes.is_empty()).count()
    }

    pub fn gene_count(&self) -> usize {
        self.items.len()
    }
}

/// Score of one gene before it is stamped and stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneScore {
    pub per_source: BTreeMap<String, f64>,
    pub combined_score: f64,
    pub source_count: i64,
    pub evidence_count: i64,
}

/// Normalize and combine; pure and deterministic
pub fn compute_scores(
    matrix: &EvidenceMatrix,
    sources: &BTreeMap<String, SourceConfig>,
) -> BTreeMap<Uuid, GeneScore> {
    let mut normalized: BTreeMap<Uuid, BTreeMap<String, f64>> = BTreeMap::new();

    for (name, genes) in &matrix.by_source {
        let Some(source) = sources.get(name) else {
            continue;
        };
        match source.kind {
            SourceKind::Count => {
                let ids: Vec<Uuid> = genes.keys().copied().collect();
                let raw: Vec<f64> = genes.values().copied().collect();
                for (gene_id, value) in ids.into_iter().zip(percentile_ranks(&raw)) {
                    normalized.entry(gene_id).or_default().insert(name.clone(), value);
                }
            }
            SourceKind::Classification => {
                for (gene_id, weight) in genes {
                    normalized.entry(*gene_id).or_default().insert(name.clone(), *weight);
                }
            }
        }
    }

    let active = matrix.active_sources();
    normalized
        .into_iter()
        .map(|(gene_id, per_source)| {
            let weighted: f64 = per_source
                .iter()
                .map(|(name, value)| sources.get(name).map_or(0.0, |s| s.weight) * value)
                .sum();
            let combined_score = if active == 0 {
                0.0
            } else {
                100.0 * weighted / active as f64
            };
            let score = GeneScore {
                source_count: per_source.len() as i64,
                evidence_count: matrix.items.get(&gene_id).copied().unwrap_or(0),
                per_source,
                combined_score,
            };
            (gene_id, score)
        })
        .collect()
}

/// Summary of one recompute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecomputeStats {
    pub evidence_scanned: usize,
    pub genes_scored: usize,
    pub active_sources: usize,
    pub removed: u64,
}

pub struct ScoringEngine {
    pool: SqlitePool,
    sources: BTreeMap<String, SourceConfig>,
    chunk_size: usize,
    /// Held for a whole recompute; engines over one database share it
    recompute_lock: Arc<Mutex<()>>,
}

impl ScoringEngine {
    pub fn new(pool: SqlitePool, sources: BTreeMap<String, SourceConfig>, chunk_size: usize) -> Self {
        Self {
            pool,
            sources,
            chunk_size: chunk_size.max(1),
            recompute_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serialize recomputes with every other engine holding `lock`
    pub fn with_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.recompute_lock = lock;
        self
    }

    /// Rebuild every gene's score from the evidence table.
    ///
    /// Evidence is read and scores are written in chunks; scores of genes
    /// that no longer have usable evidence are removed at the end. Only one
    /// recompute per lock runs at a time.
    pub async fn recompute_all(&self) -> Result<RecomputeStats> {
        let _guard = self.recompute_lock.lock().await;

        let mut matrix = EvidenceMatrix::new();
        let mut scanned = 0;
        let mut after: Option<Uuid> = None;

        loop {
            let chunk = evidence::scan_chunk(&self.pool, after, self.chunk_size).await?;
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.id);
            scanned += chunk.len();
            for record in &chunk {
                matrix.add(record, &self.sources);
            }
            if chunk.len() < self.chunk_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        let computed = compute_scores(&matrix, &self.sources);
        let computed_at = Utc::now();

        let gene_index: BTreeMap<Uuid, (String, String)> = genes::list_all(&self.pool)
            .await?
            .into_iter()
            .map(|g| (g.id, (g.symbol, g.hgnc_id)))
            .collect();

        let records: Vec<ScoreRecord> = computed
            .into_iter()
            .filter_map(|(gene_id, score)| {
                let (symbol, hgnc_id) = gene_index.get(&gene_id)?.clone();
                Some(ScoreRecord {
                    gene_id,
                    symbol,
                    hgnc_id,
                    per_source: score.per_source,
                    combined_score: score.combined_score,
                    source_count: score.source_count,
                    evidence_count: score.evidence_count,
                    computed_at,
                })
            })
            .collect();

        for chunk in records.chunks(self.chunk_size) {
            scores::write_chunk(&self.pool, chunk).await?;
            debug!(written = chunk.len(), "Score chunk committed");
        }
        let removed = scores::delete_computed_before(&self.pool, &computed_at).await?;

        let stats = RecomputeStats {
            evidence_scanned: scanned,
            genes_scored: records.len(),
            active_sources: matrix.active_sources(),
            removed,
        };
        info!(
            evidence = stats.evidence_scanned,
            genes = stats.genes_scored,
            active_sources = stats.active_sources,
            removed = stats.removed,
            "Scores recomputed"
        );
        Ok(stats)
    }
}

pub async fn get_score(pool: &SqlitePool, gene_id: Uuid) -> Result<Option<ScoreRecord>> {
    scores::get(pool, gene_id).await
}

pub async fn get_score_by_symbol(pool: &SqlitePool, symbol: &str) -> Result<Option<ScoreRecord>> {
    scores::get_by_symbol(pool, symbol).await
}

/// Page of scores, highest combined score first
pub async fn list_scores(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<ScoreRecord>> {
    scores::list(pool, limit.clamp(1, 1_000), offset.max(0)).await
}
