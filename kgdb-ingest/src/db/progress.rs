//! Source progress persistence (`source_progress`, one row per source)

use chrono::{DateTime, Utc};
use kgdb_common::db::{ProgressState, RunStatus};
use kgdb_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{fmt_ts, parse_json, parse_opt_ts, parse_ts};
use crate::utils::retry_on_lock_default;

const PROGRESS_COLUMNS: &str = r#"
    source_name, status, run_id, current_page, total_pages, current_item, total_items,
    items_processed, items_added, items_updated, items_failed, current_operation,
    last_error, checkpoint, started_at, completed_at, updated_at
"#;

fn progress_from_row(row: &SqliteRow) -> Result<ProgressState> {
    let status: String = row.try_get("status")?;
    let run_id: Option<String> = row.try_get("run_id")?;
    let checkpoint: String = row.try_get("checkpoint")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ProgressState {
        source_name: row.try_get("source_name")?,
        status: status.parse()?,
        run_id: run_id
            .as_deref()
            .map(kgdb_common::db::parse_uuid)
            .transpose()?,
        current_page: row.try_get("current_page")?,
        total_pages: row.try_get("total_pages")?,
        current_item: row.try_get("current_item")?,
        total_items: row.try_get("total_items")?,
        items_processed: row.try_get("items_processed")?,
        items_added: row.try_get("items_added")?,
        items_updated: row.try_get("items_updated")?,
        items_failed: row.try_get("items_failed")?,
        current_operation: row.try_get("current_operation")?,
        last_error: row.try_get("last_error")?,
        checkpoint: parse_json(&checkpoint, "source_progress.checkpoint")?,
        started_at: parse_opt_ts(started_at, "source_progress.started_at")?,
        completed_at: parse_opt_ts(completed_at, "source_progress.completed_at")?,
        updated_at: parse_ts(&updated_at, "source_progress.updated_at")?,
    })
}

pub async fn load(pool: &SqlitePool, source_name: &str) -> Result<Option<ProgressState>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM source_progress WHERE source_name = ?",
        PROGRESS_COLUMNS
    ))
    .bind(source_name)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(progress_from_row).transpose()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<ProgressState>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM source_progress ORDER BY source_name",
        PROGRESS_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(progress_from_row).collect()
}

/// Write the whole row in one statement so status and counters never
/// disagree on disk
pub async fn save(pool: &SqlitePool, state: &ProgressState) -> Result<()> {
    let run_id = state.run_id.map(|id| id.to_string());
    let checkpoint = serde_json::to_string(&state.checkpoint)?;
    let started_at = state.started_at.as_ref().map(fmt_ts);
    let completed_at = state.completed_at.as_ref().map(fmt_ts);
    let updated_at = fmt_ts(&state.updated_at);

    retry_on_lock_default("save_progress", || Box::pin(async {
        sqlx::query(
            r#"
            INSERT INTO source_progress (
                source_name, status, run_id, current_page, total_pages, current_item,
                total_items, items_processed, items_added, items_updated, items_failed,
                current_operation, last_error, checkpoint, started_at, completed_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_name) DO UPDATE SET
                status = excluded.status,
                run_id = excluded.run_id,
                current_page = excluded.current_page,
                total_pages = excluded.total_pages,
                current_item = excluded.current_item,
                total_items = excluded.total_items,
                items_processed = excluded.items_processed,
                items_added = excluded.items_added,
                items_updated = excluded.items_updated,
                items_failed = excluded.items_failed,
                current_operation = excluded.current_operation,
                last_error = excluded.last_error,
                checkpoint = excluded.checkpoint,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.source_name)
        .bind(state.status.as_str())
        .bind(&run_id)
        .bind(state.current_page)
        .bind(state.total_pages)
        .bind(state.current_item)
        .bind(state.total_items)
        .bind(state.items_processed)
        .bind(state.items_added)
        .bind(state.items_updated)
        .bind(state.items_failed)
        .bind(&state.current_operation)
        .bind(&state.last_error)
        .bind(&checkpoint)
        .bind(&started_at)
        .bind(&completed_at)
        .bind(&updated_at)
        .execute(pool)
        .await?;
        Ok::<_, Error>(())
    }))
    .await
}

/// Atomically claim the source for a new run.
///
/// Returns `false` without touching the row when it is already `running`.
pub async fn try_mark_running(
    pool: &SqlitePool,
    source_name: &str,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now = fmt_ts(&now);
    let run_id = run_id.to_string();

    retry_on_lock_default("claim_progress", || Box::pin(async {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO source_progress (source_name, status, updated_at)
            VALUES (?, 'idle', ?)
            ON CONFLICT(source_name) DO NOTHING
            "#,
        )
        .bind(source_name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            r#"
            UPDATE source_progress
            SET status = 'running', run_id = ?, started_at = ?, completed_at = NULL, updated_at = ?
            WHERE source_name = ? AND status != 'running'
            "#,
        )
        .bind(&run_id)
        .bind(&now)
        .bind(&now)
        .bind(source_name)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        tx.commit().await?;
        Ok::<_, Error>(claimed)
    }))
    .await
}

/// Move runs orphaned by a dead process from `running` to `paused`
pub async fn recover_stale_runs(pool: &SqlitePool) -> Result<u64> {
    let now = fmt_ts(&Utc::now());
    let result = retry_on_lock_default("recover_stale_runs", || Box::pin(async {
        Ok::<_, Error>(sqlx::query(
            r#"
            UPDATE source_progress
            SET status = ?, current_operation = 'interrupted by restart', updated_at = ?
            WHERE status = 'running'
            "#,
        )
        .bind(RunStatus::Paused.as_str())
        .bind(&now)
        .execute(pool)
        .await?)
    }))
    .await?;
    Ok(result.rows_affected())
}
