//! Classification-based sources (expert-curated gene-disease validity)
//!
//! Payload: `{"classifications": [..categories..], "diseases": [..labels..]}`.
//! Categories are kept as reported; the weight table is applied at scoring
//! time so weight changes take effect without re-ingesting.

use async_trait::async_trait;
use chrono::NaiveDate;
use kgdb_common::{Error, Result};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

use super::extract::{fetch_page, fold_date_and_score, items, text_at};
use super::writer::persist_drafts;
use super::{PersistStats, PipelineContext, RawPayload, SourcePipeline, TransformOutput};
use crate::config::{SourceConfig, SourceKind};
use crate::evidence::EvidenceDraft;
use crate::progress::ProgressTracker;

pub struct ClassificationSourcePipeline {
    ctx: PipelineContext,
}

impl ClassificationSourcePipeline {
    pub fn new(ctx: PipelineContext) -> Result<Self> {
        if ctx.source.extraction.classification_pointer.is_none() {
            return Err(Error::Config(format!(
                "sources.{}: classification sources need extraction.classification_pointer",
                ctx.name
            )));
        }
        Ok(Self { ctx })
    }
}

#[derive(Default)]
struct ClassificationGroup {
    mention: String,
    hgnc_id: Option<String>,
    classifications: BTreeSet<String>,
    diseases: BTreeSet<String>,
    date: Option<NaiveDate>,
    score: Option<f64>,
}

/// Categories recorded in a classification payload
pub fn payload_classifications(payload: &Value) -> Vec<&str> {
    payload
        .get("classifications")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

/// Group one page's items by mention text.
///
/// Without a source-supplied score, a draft's score is the highest weight
/// among its categories.
pub fn transform_classifications(
    source: &SourceConfig,
    name: &str,
    body: &Value,
) -> Result<TransformOutput> {
    let rule = &source.extraction;
    let classification_pointer = rule.classification_pointer.as_deref().ok_or_else(|| {
        Error::Config(format!("sources.{}: missing extraction.classification_pointer", name))
    })?;

    let mut groups: BTreeMap<String, ClassificationGroup> = BTreeMap::new();
    let mut skipped = 0;

    for item in items(rule, body, name)? {
        let (Some(mention), Some(category)) = (
            text_at(item, &rule.gene_pointer),
            text_at(item, classification_pointer),
        ) else {
            skipped += 1;
            continue;
        };

        let group = groups
            .entry(mention.to_uppercase())
            .or_insert_with(|| ClassificationGroup {
                mention: mention.clone(),
                ..ClassificationGroup::default()
            });
        if group.hgnc_id.is_none() {
            group.hgnc_id = rule.hgnc_pointer.as_deref().and_then(|p| text_at(item, p));
        }
        group.classifications.insert(category);
        if let Some(label) = rule.label_pointer.as_deref().and_then(|p| text_at(item, p)) {
            group.diseases.insert(label);
        }
        fold_date_and_score(rule, item, &mut group.date, &mut group.score);
    }

    let records = groups
        .into_values()
        .map(|group| {
            let weight = group
                .classifications
                .iter()
                .map(|c| source.classification_weight(c))
                .fold(f64::NEG_INFINITY, f64::max);
            let source_score = group.score.or_else(|| weight.is_finite().then_some(weight));
            EvidenceDraft {
                mention: group.mention,
                hgnc_id: group.hgnc_id,
                payload: json!({
                    "classifications": group.classifications.into_iter().collect::<Vec<_>>(),
                    "diseases": group.diseases.into_iter().collect::<Vec<_>>(),
                }),
                evidence_date: group.date,
                source_score,
            }
        })
        .collect();

    Ok(TransformOutput { records, skipped })
}

#[async_trait]
impl SourcePipeline for ClassificationSourcePipeline {
    fn name(&self) -> &str {
        &self.ctx.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Classification
    }

    fn start_page(&self) -> i64 {
        self.ctx.source.extraction.start_page
    }

    fn pool(&self) -> &SqlitePool {
        &self.ctx.pool
    }

    async fn fetch_raw(
        &self,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Option<RawPayload>> {
        fetch_page(&self.ctx, tracker, cancel).await
    }

    fn transform(&self, raw: &RawPayload) -> Result<TransformOutput> {
        transform_classifications(&self.ctx.source, &self.ctx.name, &raw.body)
    }

    async fn persist(
        &self,
        records: Vec<EvidenceDraft>,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<PersistStats> {
        persist_drafts(&self.ctx, records, tracker, cancel).await
    }
}
