//! Staging entry persistence
//!
//! A partial UNIQUE index allows only one *pending* entry per cleaned text;
//! reviewed entries keep their row so the review history survives.

use kgdb_common::db::{parse_uuid, StagingEntry, StagingStatus};
use kgdb_common::Result;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{fmt_ts, parse_json, parse_opt_ts, parse_ts};

const STAGING_COLUMNS: &str = r#"
    id, original_text, cleaned_text, source_name, source_mentions, mention_count,
    attempt_log, status, priority_score, approved_symbol, approved_hgnc_id,
    approved_aliases, linked_gene_id, reviewer, review_notes, reviewed_at,
    created_at, updated_at
"#;

/// Review queue counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub duplicate: i64,
}

fn staging_from_row(row: &SqliteRow) -> Result<StagingEntry> {
    let id: String = row.try_get("id")?;
    let source_mentions: String = row.try_get("source_mentions")?;
    let attempt_log: String = row.try_get("attempt_log")?;
    let status: String = row.try_get("status")?;
    let approved_aliases: String = row.try_get("approved_aliases")?;
    let linked_gene_id: Option<String> = row.try_get("linked_gene_id")?;
    let reviewed_at: Option<String> = row.try_get("reviewed_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(StagingEntry {
        id: parse_uuid(&id)?,
        original_text: row.try_get("original_text")?,
        cleaned_text: row.try_get("cleaned_text")?,
        source_name: row.try_get("source_name")?,
        source_mentions: parse_json(&source_mentions, "staging_entries.source_mentions")?,
        mention_count: row.try_get("mention_count")?,
        attempt_log: parse_json(&attempt_log, "staging_entries.attempt_log")?,
        status: status.parse()?,
        priority_score: row.try_get("priority_score")?,
        approved_symbol: row.try_get("approved_symbol")?,
        approved_hgnc_id: row.try_get("approved_hgnc_id")?,
        approved_aliases: parse_json(&approved_aliases, "staging_entries.approved_aliases")?,
        linked_gene_id: linked_gene_id.as_deref().map(parse_uuid).transpose()?,
        reviewer: row.try_get("reviewer")?,
        review_notes: row.try_get("review_notes")?,
        reviewed_at: parse_opt_ts(reviewed_at, "staging_entries.reviewed_at")?,
        created_at: parse_ts(&created_at, "staging_entries.created_at")?,
        updated_at: parse_ts(&updated_at, "staging_entries.updated_at")?,
    })
}

pub async fn find(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<StagingEntry>> {
    let row = sqlx::query(&format!("SELECT {} FROM staging_entries WHERE id = ?", STAGING_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(staging_from_row).transpose()
}

pub async fn find_pending_by_text(
    conn: &mut SqliteConnection,
    cleaned_text: &str,
) -> Result<Option<StagingEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM staging_entries WHERE cleaned_text = ? AND status = 'pending'",
        STAGING_COLUMNS
    ))
    .bind(cleaned_text)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(staging_from_row).transpose()
}

/// Insert a new entry or overwrite every column of an existing one
pub async fn save(conn: &mut SqliteConnection, entry: &StagingEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO staging_entries (
            id, original_text, cleaned_text, source_name, source_mentions, mention_count,
            attempt_log, status, priority_score, approved_symbol, approved_hgnc_id,
            approved_aliases, linked_gene_id, reviewer, review_notes, reviewed_at,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source_mentions = excluded.source_mentions,
            mention_count = excluded.mention_count,
            attempt_log = excluded.attempt_log,
            status = excluded.status,
            priority_score = excluded.priority_score,
            approved_symbol = excluded.approved_symbol,
            approved_hgnc_id = excluded.approved_hgnc_id,
            approved_aliases = excluded.approved_aliases,
            linked_gene_id = excluded.linked_gene_id,
            reviewer = excluded.reviewer,
            review_notes = excluded.review_notes,
            reviewed_at = excluded.reviewed_at,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entry.id.to_string())
    .bind(&entry.original_text)
    .bind(&entry.cleaned_text)
    .bind(&entry.source_name)
    .bind(serde_json::to_string(&entry.source_mentions)?)
    .bind(entry.mention_count)
    .bind(serde_json::to_string(&entry.attempt_log)?)
    .bind(entry.status.as_str())
    .bind(entry.priority_score)
    .bind(&entry.approved_symbol)
    .bind(&entry.approved_hgnc_id)
    .bind(serde_json::to_string(&entry.approved_aliases)?)
    .bind(entry.linked_gene_id.map(|id| id.to_string()))
    .bind(&entry.reviewer)
    .bind(&entry.review_notes)
    .bind(entry.reviewed_at.as_ref().map(fmt_ts))
    .bind(fmt_ts(&entry.created_at))
    .bind(fmt_ts(&entry.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<StagingEntry>> {
    let mut conn = pool.acquire().await?;
    find(&mut conn, id).await
}

/// Entries with `status`, optionally limited to those reported by `source`,
/// highest priority first
pub async fn list(
    pool: &SqlitePool,
    status: StagingStatus,
    source: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<StagingEntry>> {
    let rows = match source {
        Some(source) => {
            sqlx::query(&format!(
                r#"
                SELECT {} FROM staging_entries
                WHERE status = ?
                  AND (source_name = ?
                       OR EXISTS (SELECT 1 FROM json_each(source_mentions) WHERE key = ?))
                ORDER BY priority_score DESC, created_at ASC, id ASC
                LIMIT ? OFFSET ?
                "#,
                STAGING_COLUMNS
            ))
            .bind(status.as_str())
            .bind(source)
            .bind(source)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                r#"
                SELECT {} FROM staging_entries
                WHERE status = ?
                ORDER BY priority_score DESC, created_at ASC, id ASC
                LIMIT ? OFFSET ?
                "#,
                STAGING_COLUMNS
            ))
            .bind(status.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(staging_from_row).collect()
}

pub async fn stats(pool: &SqlitePool) -> Result<StagingStats> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM staging_entries GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut stats = StagingStats::default();
    for (status, count) in rows {
        match status.parse::<StagingStatus>()? {
            StagingStatus::Pending => stats.pending = count,
            StagingStatus::Approved => stats.approved = count,
            StagingStatus::Rejected => stats.rejected = count,
            StagingStatus::Duplicate => stats.duplicate = count,
        }
    }
    Ok(stats)
}

/// Entries (any status) whose cleaned text equals `cleaned_text`
pub async fn count_by_text(pool: &SqlitePool, cleaned_text: &str) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM staging_entries WHERE cleaned_text = ?")
            .bind(cleaned_text)
            .fetch_one(pool)
            .await?,
    )
}

/// Whether a reviewer already rejected this cleaned text
pub async fn is_rejected_text(conn: &mut SqliteConnection, cleaned_text: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM staging_entries WHERE cleaned_text = ? AND status = 'rejected'",
    )
    .bind(cleaned_text)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}
