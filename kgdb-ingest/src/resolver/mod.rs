//! Gene identity resolution
//!
//! Maps raw mentions to canonical genes. Per distinct cleaned symbol:
//!
//! 1. exact match against known symbols/aliases (or a source-supplied HGNC id)
//! 2. one batched nomenclature lookup per chunk of still-unresolved symbols
//! 3. on a confident hit, create or reuse the gene
//! 4. otherwise stage the mention for human review
//!
//! Steps 3 and 4 run under a per-symbol lock inside one transaction, and the
//! symbol is re-checked first, so concurrent pipelines resolving the same
//! unknown symbol end up with a single gene.

pub mod authority;
pub mod cleaning;
pub mod locks;

pub use authority::{HgncClient, NomenclatureAuthority, NomenclatureRecord};
pub use cleaning::{Cleaned, MentionCleaner};
pub use locks::KeyedLocks;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use kgdb_common::db::{Gene, ResolutionAttempt, StagingEntry, StagingStatus};
use kgdb_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ResolverConfig;
use crate::db::{genes, staging};
use crate::utils::retry_on_lock_default;

pub const STRATEGY_ALIAS_LOOKUP: &str = "alias_lookup";
pub const STRATEGY_NOMENCLATURE: &str = "nomenclature_batch";

/// A raw gene mention as reported by a source
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub text: String,
    /// Identifier the source supplied alongside the text, if any
    pub hgnc_id: Option<String>,
}

impl Mention {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            hgnc_id: None,
        }
    }

    pub fn with_hgnc_id(mut self, hgnc_id: Option<String>) -> Self {
        self.hgnc_id = hgnc_id.filter(|id| !id.trim().is_empty());
        self
    }
}

/// Outcome of resolving one mention
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Matched a gene already in the store
    MatchedExisting(Gene),
    /// Matched through the nomenclature authority (gene created or reused)
    MatchedExternal(Gene),
    /// Queued for human review
    Staged { staging_id: Uuid, cleaned: String },
    /// Not a gene mention at all (denylisted, too short, previously rejected)
    Rejected { reason: String },
}

impl Resolution {
    pub fn gene(&self) -> Option<&Gene> {
        match self {
            Resolution::MatchedExisting(gene) | Resolution::MatchedExternal(gene) => Some(gene),
            Resolution::Staged { .. } | Resolution::Rejected { .. } => None,
        }
    }
}

/// Per-symbol aggregate of one batch
#[derive(Debug, Clone)]
struct SymbolGroup {
    original_text: String,
    hgnc_hint: Option<String>,
    occurrences: i64,
    attempts: Vec<(&'static str, String)>,
}

/// Resolver tally for one batch, used for run logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub existing: usize,
    pub external: usize,
    pub staged: usize,
    pub rejected: usize,
}

impl ResolveStats {
    pub fn tally(resolutions: &[Resolution]) -> Self {
        let mut stats = Self::default();
        for resolution in resolutions {
            match resolution {
                Resolution::MatchedExisting(_) => stats.existing += 1,
                Resolution::MatchedExternal(_) => stats.external += 1,
                Resolution::Staged { .. } => stats.staged += 1,
                Resolution::Rejected { .. } => stats.rejected += 1,
            }
        }
        stats
    }
}

pub struct GeneResolver {
    pool: SqlitePool,
    authority: Arc<dyn NomenclatureAuthority>,
    locks: KeyedLocks,
    cleaner: MentionCleaner,
    batch_size: usize,
    max_parallel_lookups: usize,
    source_agreement_bonus: f64,
}

impl GeneResolver {
    pub fn new(
        pool: SqlitePool,
        authority: Arc<dyn NomenclatureAuthority>,
        locks: KeyedLocks,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            pool,
            authority,
            locks,
            cleaner: MentionCleaner::new(&config.extra_denylist, config.min_symbol_length),
            batch_size: config.batch_size.max(1),
            max_parallel_lookups: config.max_parallel_lookups.max(1),
            source_agreement_bonus: config.source_agreement_bonus,
        }
    }

    pub fn cleaner(&self) -> &MentionCleaner {
        &self.cleaner
    }

    /// Resolve a single mention
    pub async fn resolve(
        &self,
        source_name: &str,
        mention: &Mention,
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let mut resolutions = self
            .resolve_batch(source_name, std::slice::from_ref(mention), cancel)
            .await?;
        resolutions
            .pop()
            .ok_or_else(|| Error::Internal("Resolver returned no result".to_string()))
    }

    /// Resolve `mentions`, returning one resolution per mention in input order.
    ///
    /// Errors are pipeline-fatal (storage failure, authority outage,
    /// cancellation); ambiguity and rejection are ordinary outcomes.
    pub async fn resolve_batch(
        &self,
        source_name: &str,
        mentions: &[Mention],
        cancel: &CancellationToken,
    ) -> Result<Vec<Resolution>> {
        let cleaned: Vec<Cleaned> = mentions.iter().map(|m| self.cleaner.clean(&m.text)).collect();

        let mut groups: BTreeMap<String, SymbolGroup> = BTreeMap::new();
        for (mention, outcome) in mentions.iter().zip(&cleaned) {
            if let Cleaned::Symbol(symbol) = outcome {
                let group = groups.entry(symbol.clone()).or_insert_with(|| SymbolGroup {
                    original_text: mention.text.clone(),
                    hgnc_hint: None,
                    occurrences: 0,
                    attempts: Vec::new(),
                });
                group.occurrences += 1;
                if group.hgnc_hint.is_none() {
                    group.hgnc_hint = mention.hgnc_id.clone();
                }
            }
        }

        let mut resolved: HashMap<String, Resolution> = HashMap::new();
        self.match_local(&mut groups, &mut resolved, cancel).await?;

        let unresolved: Vec<String> = groups
            .keys()
            .filter(|symbol| !resolved.contains_key(*symbol))
            .cloned()
            .collect();

        let found = self.lookup_external(&unresolved, cancel).await?;

        for symbol in &unresolved {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(group) = groups.get_mut(symbol) else {
                continue;
            };
            if !found.contains_key(symbol) {
                group.attempts.push((
                    STRATEGY_NOMENCLATURE,
                    "no confident match at nomenclature authority".to_string(),
                ));
            }

            let group = &*group;
            let record = found.get(symbol);
            let resolution = retry_on_lock_default("resolve_symbol", || {
                self.write_symbol(source_name, symbol, group, record).boxed()
            })
            .await?;
            resolved.insert(symbol.clone(), resolution);
        }

        let resolutions: Vec<Resolution> = cleaned
            .into_iter()
            .map(|outcome| match outcome {
                Cleaned::Rejected(reason) => Ok(Resolution::Rejected { reason }),
                Cleaned::Symbol(symbol) => resolved.get(&symbol).cloned().ok_or_else(|| {
                    Error::Internal(format!("Symbol {} left unresolved", symbol))
                }),
            })
            .collect::<Result<_>>()?;

        let stats = ResolveStats::tally(&resolutions);
        debug!(
            source = %source_name,
            mentions = mentions.len(),
            symbols = groups.len(),
            existing = stats.existing,
            external = stats.external,
            staged = stats.staged,
            rejected = stats.rejected,
            "Resolved batch"
        );
        Ok(resolutions)
    }

    /// Exact matches against the store; failed strategies are recorded on the group
    async fn match_local(
        &self,
        groups: &mut BTreeMap<String, SymbolGroup>,
        resolved: &mut HashMap<String, Resolution>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        for (symbol, group) in groups.iter_mut() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if staging::is_rejected_text(&mut conn, symbol).await? {
                resolved.insert(
                    symbol.clone(),
                    Resolution::Rejected {
                        reason: "previously rejected in review".to_string(),
                    },
                );
                continue;
            }

            if let Some(hgnc_id) = &group.hgnc_hint {
                if let Some(gene) = genes::find_by_hgnc_id(&mut conn, hgnc_id).await? {
                    resolved.insert(symbol.clone(), Resolution::MatchedExisting(gene));
                    continue;
                }
            }

            match genes::lookup_symbol(&mut conn, symbol).await? {
                genes::AliasLookup::Unique(gene) => {
                    resolved.insert(symbol.clone(), Resolution::MatchedExisting(gene));
                }
                genes::AliasLookup::Ambiguous(candidates) => {
                    group.attempts.push((
                        STRATEGY_ALIAS_LOOKUP,
                        format!("ambiguous: {}", candidates.join(", ")),
                    ));
                }
                genes::AliasLookup::NotFound => {
                    group.attempts.push((
                        STRATEGY_ALIAS_LOOKUP,
                        "no gene with this symbol or alias".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// One authority request per chunk, with bounded parallelism
    async fn lookup_external(
        &self,
        symbols: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, NomenclatureRecord>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let lookups: Vec<_> = symbols
            .chunks(self.batch_size.max(1))
            .map(|chunk| self.authority.lookup_batch(chunk, cancel))
            .collect();
        let mut results = stream::iter(lookups).buffer_unordered(self.max_parallel_lookups.max(1));

        let mut found = HashMap::new();
        while let Some(part) = results.next().await {
            found.extend(part?);
        }
        Ok(found)
    }

    /// Create/reuse the gene or stage the mention, serialized per symbol
    async fn write_symbol(
        &self,
        source_name: &str,
        symbol: &str,
        group: &SymbolGroup,
        record: Option<&NomenclatureRecord>,
    ) -> Result<Resolution> {
        let _guard = self.locks.lock(symbol).await;
        let mut tx = self.pool.begin().await?;

        // Another pipeline may have resolved it while we waited
        if let genes::AliasLookup::Unique(gene) = genes::lookup_symbol(&mut *tx, symbol).await? {
            tx.commit().await?;
            return Ok(Resolution::MatchedExisting(gene));
        }

        let resolution = match record {
            Some(record) => {
                let mut aliases = record.aliases.clone();
                if !record.symbol.eq_ignore_ascii_case(symbol) {
                    aliases.push(symbol.to_string());
                }
                let (gene, created) =
                    genes::upsert_gene(&mut *tx, &record.hgnc_id, &record.symbol, &aliases).await?;
                if created {
                    info!(
                        source = %source_name,
                        mention = %symbol,
                        hgnc_id = %gene.hgnc_id,
                        symbol = %gene.symbol,
                        "Created gene from nomenclature match"
                    );
                }
                Resolution::MatchedExternal(gene)
            }
            None => {
                let entry = self.stage(&mut *tx, source_name, symbol, group).await?;
                Resolution::Staged {
                    staging_id: entry.id,
                    cleaned: entry.cleaned_text,
                }
            }
        };

        tx.commit().await?;
        Ok(resolution)
    }

    async fn stage(
        &self,
        conn: &mut sqlx::SqliteConnection,
        source_name: &str,
        symbol: &str,
        group: &SymbolGroup,
    ) -> Result<StagingEntry> {
        let now = Utc::now();
        let attempts: Vec<ResolutionAttempt> = group
            .attempts
            .iter()
            .map(|(strategy, outcome)| ResolutionAttempt {
                at: now,
                source_name: source_name.to_string(),
                strategy: strategy.to_string(),
                outcome: outcome.clone(),
            })
            .collect();

        let mut entry = match staging::find_pending_by_text(conn, symbol).await? {
            Some(entry) => entry,
            None => {
                info!(source = %source_name, mention = %symbol, "Staging unresolved mention");
                StagingEntry {
                    id: Uuid::new_v4(),
                    original_text: group.original_text.clone(),
                    cleaned_text: symbol.to_string(),
                    source_name: source_name.to_string(),
                    source_mentions: BTreeMap::new(),
                    mention_count: 0,
                    attempt_log: Vec::new(),
                    status: StagingStatus::Pending,
                    priority_score: 0.0,
                    approved_symbol: None,
                    approved_hgnc_id: None,
                    approved_aliases: Vec::new(),
                    linked_gene_id: None,
                    reviewer: None,
                    review_notes: None,
                    reviewed_at: None,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        record_mentions(&mut entry, source_name, group.occurrences, self.source_agreement_bonus);
        for attempt in attempts {
            append_attempt(&mut entry.attempt_log, attempt);
        }
        entry.updated_at = now;

        staging::save(conn, &entry).await?;
        Ok(entry)
    }
}

/// Update per-source counts and the derived review priority.
///
/// Re-reporting the same mentions on a later run keeps the count stable;
/// each additional independent source adds `agreement_bonus`.
pub fn record_mentions(entry: &mut StagingEntry, source_name: &str, occurrences: i64, agreement_bonus: f64) {
    let count = entry.source_mentions.entry(source_name.to_string()).or_insert(0);
    *count = (*count).max(occurrences);

    entry.mention_count = entry.source_mentions.values().sum();
    let extra_sources = entry.source_mentions.len().saturating_sub(1) as f64;
    entry.priority_score = entry.mention_count as f64 + agreement_bonus * extra_sources;
}

/// Append unless the latest attempt for the same source and strategy had the same outcome
pub fn append_attempt(log: &mut Vec<ResolutionAttempt>, attempt: ResolutionAttempt) {
    let repeated = log
        .iter()
        .rev()
        .find(|a| a.source_name == attempt.source_name && a.strategy == attempt.strategy)
        .map_or(false, |a| a.outcome == attempt.outcome);
    if !repeated {
        log.push(attempt);
    }
}
