//! Evidence record persistence
//!
//! The `(gene_id, source_name)` UNIQUE constraint backs the one-record-per-
//! gene-and-source rule; callers merge into the existing row instead of
//! inserting a second one.

use chrono::NaiveDate;
use kgdb_common::db::{parse_uuid, EvidenceRecord};
use kgdb_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::{fmt_ts, parse_json, parse_ts};

const EVIDENCE_COLUMNS: &str = "id, gene_id, source_name, payload, evidence_date, source_score, lineage, created_at, updated_at";

fn evidence_from_row(row: &SqliteRow) -> Result<EvidenceRecord> {
    let id: String = row.try_get("id")?;
    let gene_id: String = row.try_get("gene_id")?;
    let payload: String = row.try_get("payload")?;
    let evidence_date: Option<String> = row.try_get("evidence_date")?;
    let lineage: String = row.try_get("lineage")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let evidence_date = evidence_date
        .map(|d| {
            NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .map_err(|e| Error::Internal(format!("Failed to parse evidence_date: {}", e)))
        })
        .transpose()?;

    Ok(EvidenceRecord {
        id: parse_uuid(&id)?,
        gene_id: parse_uuid(&gene_id)?,
        source_name: row.try_get("source_name")?,
        payload: parse_json(&payload, "evidence.payload")?,
        evidence_date,
        source_score: row.try_get("source_score")?,
        lineage: parse_json(&lineage, "evidence.lineage")?,
        created_at: parse_ts(&created_at, "evidence.created_at")?,
        updated_at: parse_ts(&updated_at, "evidence.updated_at")?,
    })
}

pub async fn find(
    conn: &mut SqliteConnection,
    gene_id: Uuid,
    source_name: &str,
) -> Result<Option<EvidenceRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM evidence WHERE gene_id = ? AND source_name = ?",
        EVIDENCE_COLUMNS
    ))
    .bind(gene_id.to_string())
    .bind(source_name)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(evidence_from_row).transpose()
}

pub async fn insert(conn: &mut SqliteConnection, record: &EvidenceRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO evidence (
            id, gene_id, source_name, payload, evidence_date, source_score,
            lineage, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.gene_id.to_string())
    .bind(&record.source_name)
    .bind(serde_json::to_string(&record.payload)?)
    .bind(record.evidence_date.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(record.source_score)
    .bind(serde_json::to_string(&record.lineage)?)
    .bind(fmt_ts(&record.created_at))
    .bind(fmt_ts(&record.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Overwrite the mutable fields of an existing record (identity is kept)
pub async fn update(conn: &mut SqliteConnection, record: &EvidenceRecord) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE evidence SET
            payload = ?, evidence_date = ?, source_score = ?, lineage = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(&record.payload)?)
    .bind(record.evidence_date.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(record.source_score)
    .bind(serde_json::to_string(&record.lineage)?)
    .bind(fmt_ts(&record.updated_at))
    .bind(record.id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Evidence record {}", record.id)));
    }
    Ok(())
}

pub async fn list_for_gene(pool: &SqlitePool, gene_id: Uuid) -> Result<Vec<EvidenceRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM evidence WHERE gene_id = ? ORDER BY source_name",
        EVIDENCE_COLUMNS
    ))
    .bind(gene_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(evidence_from_row).collect()
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COUNT(*) FROM evidence")
        .fetch_one(pool)
        .await?)
}

pub async fn count_for_source(pool: &SqlitePool, source_name: &str) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM evidence WHERE source_name = ?")
            .bind(source_name)
            .fetch_one(pool)
            .await?,
    )
}

/// Keyset-paginated scan ordered by id; pass the last id seen to continue
pub async fn scan_chunk(
    pool: &SqlitePool,
    after_id: Option<Uuid>,
    limit: usize,
) -> Result<Vec<EvidenceRecord>> {
    let after = after_id.map(|id| id.to_string()).unwrap_or_default();
    let rows = sqlx::query(&format!(
        "SELECT {} FROM evidence WHERE id > ? ORDER BY id LIMIT ?",
        EVIDENCE_COLUMNS
    ))
    .bind(after)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;
    rows.iter().map(evidence_from_row).collect()
}
