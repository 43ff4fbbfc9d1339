//! Derived score persistence (`gene_scores`)

use chrono::{DateTime, Utc};
use kgdb_common::db::{parse_uuid, ScoreRecord};
use kgdb_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{fmt_ts, parse_json, parse_ts};
use crate::utils::retry_on_lock_default;

const SCORE_SELECT: &str = r#"
    SELECT s.gene_id, g.symbol, g.hgnc_id, s.per_source, s.combined_score,
           s.source_count, s.evidence_count, s.computed_at
    FROM gene_scores s
    JOIN genes g ON g.id = s.gene_id
"#;

fn score_from_row(row: &SqliteRow) -> Result<ScoreRecord> {
    let gene_id: String = row.try_get("gene_id")?;
    let per_source: String = row.try_get("per_source")?;
    let computed_at: String = row.try_get("computed_at")?;

    Ok(ScoreRecord {
        gene_id: parse_uuid(&gene_id)?,
        symbol: row.try_get("symbol")?,
        hgnc_id: row.try_get("hgnc_id")?,
        per_source: parse_json(&per_source, "gene_scores.per_source")?,
        combined_score: row.try_get("combined_score")?,
        source_count: row.try_get("source_count")?,
        evidence_count: row.try_get("evidence_count")?,
        computed_at: parse_ts(&computed_at, "gene_scores.computed_at")?,
    })
}

/// Upsert one chunk of scores in a single transaction.
///
/// A row already stamped later than the incoming one is left alone.
pub async fn write_chunk(pool: &SqlitePool, scores: &[ScoreRecord]) -> Result<()> {
    let rows = scores
        .iter()
        .map(|s| {
            Ok((
                s.gene_id.to_string(),
                serde_json::to_string(&s.per_source)?,
                s.combined_score,
                s.source_count,
                s.evidence_count,
                fmt_ts(&s.computed_at),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    retry_on_lock_default("write_scores", || Box::pin(async {
        let mut tx = pool.begin().await?;
        for (gene_id, per_source, combined, sources, evidence, computed_at) in &rows {
            sqlx::query(
                r#"
                INSERT INTO gene_scores (
                    gene_id, per_source, combined_score, source_count, evidence_count, computed_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(gene_id) DO UPDATE SET
                    per_source = excluded.per_source,
                    combined_score = excluded.combined_score,
                    source_count = excluded.source_count,
                    evidence_count = excluded.evidence_count,
                    computed_at = excluded.computed_at
                WHERE excluded.computed_at >= gene_scores.computed_at
                "#,
            )
            .bind(gene_id)
            .bind(per_source)
            .bind(combined)
            .bind(sources)
            .bind(evidence)
            .bind(computed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok::<_, Error>(())
    }))
    .await
}

/// Drop scores left over from recomputes stamped before `computed_at`
pub async fn delete_computed_before(pool: &SqlitePool, computed_at: &DateTime<Utc>) -> Result<u64> {
    let stamp = fmt_ts(computed_at);
    let result = retry_on_lock_default("prune_scores", || Box::pin(async {
        Ok::<_, Error>(sqlx::query("DELETE FROM gene_scores WHERE computed_at < ?")
            .bind(&stamp)
            .execute(pool)
            .await?)
    }))
    .await?;
    Ok(result.rows_affected())
}

pub async fn get(pool: &SqlitePool, gene_id: Uuid) -> Result<Option<ScoreRecord>> {
    let row = sqlx::query(&format!("{} WHERE s.gene_id = ?", SCORE_SELECT))
        .bind(gene_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(score_from_row).transpose()
}

pub async fn get_by_symbol(pool: &SqlitePool, symbol: &str) -> Result<Option<ScoreRecord>> {
    let row = sqlx::query(&format!(
        "{} WHERE g.symbol = ? COLLATE NOCASE ORDER BY g.hgnc_id LIMIT 1",
        SCORE_SELECT
    ))
    .bind(symbol.trim())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(score_from_row).transpose()
}

/// Highest combined score first; ties broken by gene id for stable paging
pub async fn list(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<ScoreRecord>> {
    let rows = sqlx::query(&format!(
        "{} ORDER BY s.combined_score DESC, s.gene_id ASC LIMIT ? OFFSET ?",
        SCORE_SELECT
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.iter().map(score_from_row).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM gene_scores")
        .fetch_one(pool)
        .await?)
}
