//! Human review of staged mentions
//!
//! Each operation moves a pending entry to a terminal status exactly once,
//! inside one transaction and under the same per-symbol lock the resolver
//! uses, so an approval cannot race a pipeline creating the same gene.

use chrono::Utc;
use kgdb_common::db::{Gene, StagingEntry, StagingStatus};
use kgdb_common::{Error, Result};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::db::staging::{self, StagingStats};
use crate::db::genes;
use crate::resolver::KeyedLocks;

/// Default page size of the review queue
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// Reviewer-supplied canonical identity for an approval
#[derive(Debug, Clone, PartialEq)]
pub struct Approval {
    pub symbol: String,
    pub hgnc_id: String,
    pub aliases: Vec<String>,
    pub reviewer: String,
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct ReviewService {
    pool: SqlitePool,
    locks: KeyedLocks,
}

impl ReviewService {
    pub fn new(pool: SqlitePool, locks: KeyedLocks) -> Self {
        Self { pool, locks }
    }

    /// Pending entries, highest priority first, optionally only those a
    /// given source reported
    pub async fn list_pending(
        &self,
        source_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StagingEntry>> {
        staging::list(
            &self.pool,
            StagingStatus::Pending,
            source_filter,
            limit.clamp(1, 1_000),
            offset.max(0),
        )
        .await
    }

    pub async fn get_staging(&self, id: Uuid) -> Result<StagingEntry> {
        staging::get(&self.pool, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Staging entry {}", id)))
    }

    pub async fn stats(&self) -> Result<StagingStats> {
        staging::stats(&self.pool).await
    }

    /// Create (or reuse) the gene for `approval.hgnc_id` and link the entry.
    ///
    /// The mention text becomes an alias so later identical mentions resolve
    /// without staging again.
    pub async fn approve(&self, staging_id: Uuid, approval: Approval) -> Result<Gene> {
        let symbol = genes::normalize_symbol(&approval.symbol);
        let hgnc_id = approval.hgnc_id.trim().to_string();
        if symbol.is_empty() || hgnc_id.is_empty() {
            return Err(Error::InvalidInput(
                "approval needs a symbol and an identifier".to_string(),
            ));
        }
        require_reviewer(&approval.reviewer)?;

        let entry = self.get_staging(staging_id).await?;
        let _guard = self.locks.lock(&entry.cleaned_text).await;
        let mut tx = self.pool.begin().await?;
        let mut entry = load_pending(&mut *tx, staging_id).await?;

        let mut aliases: Vec<String> = approval
            .aliases
            .iter()
            .map(|a| genes::normalize_symbol(a))
            .filter(|a| !a.is_empty())
            .collect();
        aliases.push(entry.cleaned_text.clone());

        let (gene, created) = genes::upsert_gene(&mut *tx, &hgnc_id, &symbol, &aliases).await?;

        let now = Utc::now();
        entry.status = StagingStatus::Approved;
        entry.approved_symbol = Some(symbol);
        entry.approved_hgnc_id = Some(hgnc_id);
        entry.approved_aliases = aliases;
        entry.linked_gene_id = Some(gene.id);
        entry.reviewer = Some(approval.reviewer.trim().to_string());
        entry.review_notes = approval.notes;
        entry.reviewed_at = Some(now);
        entry.updated_at = now;
        staging::save(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(
            staging_id = %staging_id,
            mention = %entry.cleaned_text,
            gene_id = %gene.id,
            symbol = %gene.symbol,
            created,
            "Staging entry approved"
        );
        Ok(gene)
    }

    pub async fn reject(
        &self,
        staging_id: Uuid,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<StagingEntry> {
        require_reviewer(reviewer)?;

        let entry = self.get_staging(staging_id).await?;
        let _guard = self.locks.lock(&entry.cleaned_text).await;
        let mut tx = self.pool.begin().await?;
        let mut entry = load_pending(&mut *tx, staging_id).await?;

        let now = Utc::now();
        entry.status = StagingStatus::Rejected;
        entry.reviewer = Some(reviewer.trim().to_string());
        entry.review_notes = notes;
        entry.reviewed_at = Some(now);
        entry.updated_at = now;
        staging::save(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(staging_id = %staging_id, mention = %entry.cleaned_text, "Staging entry rejected");
        Ok(entry)
    }

    /// Mark the mention as another name of an existing gene
    pub async fn mark_duplicate(
        &self,
        staging_id: Uuid,
        gene_id: Uuid,
        reviewer: &str,
    ) -> Result<Gene> {
        require_reviewer(reviewer)?;

        let entry = self.get_staging(staging_id).await?;
        let _guard = self.locks.lock(&entry.cleaned_text).await;
        let mut tx = self.pool.begin().await?;
        let mut entry = load_pending(&mut *tx, staging_id).await?;

        let gene = genes::find_by_id(&mut *tx, gene_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Gene {}", gene_id)))?;
        let gene = genes::add_aliases(&mut *tx, &gene, &[entry.cleaned_text.clone()]).await?;

        let now = Utc::now();
        entry.status = StagingStatus::Duplicate;
        entry.linked_gene_id = Some(gene.id);
        entry.reviewer = Some(reviewer.trim().to_string());
        entry.reviewed_at = Some(now);
        entry.updated_at = now;
        staging::save(&mut *tx, &entry).await?;
        tx.commit().await?;

        info!(
            staging_id = %staging_id,
            mention = %entry.cleaned_text,
            gene_id = %gene.id,
            "Staging entry marked duplicate"
        );
        Ok(gene)
    }
}

fn require_reviewer(reviewer: &str) -> Result<()> {
    if reviewer.trim().is_empty() {
        return Err(Error::InvalidInput("reviewer is required".to_string()));
    }
    Ok(())
}

async fn load_pending(conn: &mut SqliteConnection, id: Uuid) -> Result<StagingEntry> {
    let entry = staging::find(conn, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Staging entry {}", id)))?;
    if entry.status != StagingStatus::Pending {
        return Err(Error::InvalidState(format!(
            "Staging entry {} is already {}",
            id,
            entry.status.as_str()
        )));
    }
    Ok(entry)
}
