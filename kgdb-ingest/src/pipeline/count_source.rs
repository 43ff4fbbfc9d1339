//! Count-based sources (panels, phenotype terms, publications per gene)
//!
//! Payload shapes:
//! - with a count key: `{"keys": [..distinct keys..]}`; the count is the
//!   number of keys, so reports spread over several pages or runs union
//!   into one set instead of being double counted
//! - otherwise: `{"pages": {"<page>": n}}`, where `n` is the page's summed
//!   count field or its number of items. The count is the sum over pages;
//!   keying by page keeps a replayed page from being added twice

use async_trait::async_trait;
use chrono::NaiveDate;
use kgdb_common::Result;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

use super::extract::{fetch_page, fold_date_and_score, i64_at, items, text_at};
use super::writer::persist_drafts;
use super::{PersistStats, PipelineContext, RawPayload, SourcePipeline, TransformOutput};
use crate::config::{ExtractionRule, SourceKind};
use crate::evidence::EvidenceDraft;
use crate::progress::ProgressTracker;

pub struct CountSourcePipeline {
    ctx: PipelineContext,
}

#[derive(Default)]
struct CountGroup {
    mention: String,
    hgnc_id: Option<String>,
    keys: BTreeSet<String>,
    count: i64,
    date: Option<NaiveDate>,
    score: Option<f64>,
}

impl CountSourcePipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }
}

/// Raw count of a count-source payload
pub fn payload_count(payload: &Value) -> Option<f64> {
    if let Some(keys) = payload.get("keys").and_then(Value::as_array) {
        return Some(keys.len() as f64);
    }
    if let Some(pages) = payload.get("pages").and_then(Value::as_object) {
        return Some(pages.values().filter_map(Value::as_f64).sum());
    }
    payload.get("count").and_then(Value::as_f64)
}

/// Group one page's items by mention text
pub fn transform_counts(
    rule: &ExtractionRule,
    source: &str,
    page: i64,
    body: &Value,
) -> Result<TransformOutput> {
    let mut groups: BTreeMap<String, CountGroup> = BTreeMap::new();
    let mut skipped = 0;

    for item in items(rule, body, source)? {
        let Some(mention) = text_at(item, &rule.gene_pointer) else {
            skipped += 1;
            continue;
        };

        let key = match &rule.count_key_pointer {
            Some(pointer) => match text_at(item, pointer) {
                Some(key) => Some(key),
                None => {
                    skipped += 1;
                    continue;
                }
            },
            None => None,
        };

        let increment = match &rule.count_pointer {
            Some(pointer) => match i64_at(item, pointer) {
                Some(n) if n >= 0 => n,
                _ => {
                    skipped += 1;
                    continue;
                }
            },
            None => 1,
        };

        let group = groups.entry(mention.to_uppercase()).or_insert_with(|| CountGroup {
            mention: mention.clone(),
            ..CountGroup::default()
        });
        if group.hgnc_id.is_none() {
            group.hgnc_id = rule.hgnc_pointer.as_deref().and_then(|p| text_at(item, p));
        }
        if let Some(key) = key {
            group.keys.insert(key);
        }
        group.count += increment;
        fold_date_and_score(rule, item, &mut group.date, &mut group.score);
    }

    let records = groups
        .into_values()
        .map(|group| {
            let payload = if rule.count_key_pointer.is_some() {
                json!({ "keys": group.keys.into_iter().collect::<Vec<_>>() })
            } else {
                json!({ "pages": { page.to_string(): group.count } })
            };
            EvidenceDraft {
                mention: group.mention,
                hgnc_id: group.hgnc_id,
                payload,
                evidence_date: group.date,
                source_score: group.score,
            }
        })
        .collect();

    Ok(TransformOutput { records, skipped })
}

#[async_trait]
impl SourcePipeline for CountSourcePipeline {
    fn name(&self) -> &str {
        &self.ctx.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Count
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
        transform_counts(&self.ctx.source.extraction, &self.ctx.name, raw.page, &raw.body)
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
