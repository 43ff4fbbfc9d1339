//! Resumable per-source run state
//!
//! `ProgressTracker` owns the in-memory copy of a source's `ProgressState`
//! and writes the full row on every transition, so the persisted row always
//! pairs counters with the status they were produced under.
//!
//! The cursor (`current_page`) only advances after every record of a page has
//! been persisted; a resumed run refetches at most the page it was on. Within
//! that page the checkpoint records how many records were already committed
//! (`page_persisted`) and whether its skipped items were counted, so a
//! replayed page neither rewrites nor recounts them.

use chrono::Utc;
use kgdb_common::db::{ProgressState, RunStatus};
use kgdb_common::{Error, Result};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::progress;

pub struct ProgressTracker {
    pool: SqlitePool,
    state: ProgressState,
}

impl ProgressTracker {
    /// Load the persisted state of `source_name` (idle if it never ran)
    pub async fn load(pool: SqlitePool, source_name: &str) -> Result<Self> {
        let state = progress::load(&pool, source_name)
            .await?
            .unwrap_or_else(|| ProgressState::idle(source_name));
        Ok(Self { pool, state })
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn source_name(&self) -> &str {
        &self.state.source_name
    }

    /// Next page to fetch
    pub fn current_page(&self) -> i64 {
        self.state.current_page
    }

    pub fn checkpoint(&self) -> &Value {
        &self.state.checkpoint
    }

    /// Records of the current page committed before the run was interrupted
    pub fn persisted_on_page(&self) -> usize {
        self.state
            .checkpoint
            .get("page_persisted")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }

    /// True once the last page of the current run has been persisted
    pub fn is_exhausted(&self) -> bool {
        self.state.checkpoint.get("exhausted").and_then(Value::as_bool) == Some(true)
    }

    /// Claim the source for `run_id`.
    ///
    /// Returns `false` (and changes nothing) when another run holds it.
    /// With `resume`, a paused or failed run keeps its cursor and counters;
    /// every other start begins at `start_page` with zeroed counters.
    pub async fn start(&mut self, run_id: Uuid, resume: bool, start_page: i64) -> Result<bool> {
        let previous = progress::load(&self.pool, &self.state.source_name)
            .await?
            .unwrap_or_else(|| ProgressState::idle(self.state.source_name.clone()));

        let now = Utc::now();
        if !progress::try_mark_running(&self.pool, &self.state.source_name, run_id, now).await? {
            self.state = previous;
            return Ok(false);
        }

        let resumable =
            resume && matches!(previous.status, RunStatus::Paused | RunStatus::Failed);

        self.state = previous;
        self.state.status = RunStatus::Running;
        self.state.run_id = Some(run_id);
        self.state.started_at = Some(now);
        self.state.completed_at = None;

        if resumable {
            info!(
                source = %self.state.source_name,
                page = self.state.current_page,
                processed = self.state.items_processed,
                "Resuming run"
            );
            self.state.current_operation = format!("resuming at page {}", self.state.current_page);
        } else {
            if resume {
                debug!(
                    source = %self.state.source_name,
                    previous = %self.state.status,
                    "Nothing to resume, starting fresh"
                );
            }
            self.clear_cursor(start_page);
            self.state.current_operation = "starting".to_string();
        }

        self.save().await?;
        Ok(true)
    }

    pub async fn set_operation(&mut self, operation: impl Into<String>) -> Result<()> {
        self.state.current_operation = operation.into();
        self.save().await
    }

    /// Add one committed batch to the run counters
    pub async fn record_batch(
        &mut self,
        processed: i64,
        added: i64,
        updated: i64,
        failed: i64,
    ) -> Result<()> {
        self.state.items_processed += processed;
        self.state.items_added += added;
        self.state.items_updated += updated;
        self.state.items_failed += failed;
        self.state.current_item += processed;
        let on_page = self.persisted_on_page() as i64 + processed;
        self.set_checkpoint_field("page_persisted", json!(on_page));
        self.save().await
    }

    /// Count items of the current page skipped before persistence.
    ///
    /// A page's skips are counted once, even when the page is replayed.
    pub async fn record_skipped(&mut self, skipped: i64) -> Result<()> {
        let counted = self.state.checkpoint.get("page_skipped").and_then(Value::as_bool) == Some(true);
        if skipped == 0 || counted {
            return Ok(());
        }
        self.state.items_failed += skipped;
        self.set_checkpoint_field("page_skipped", json!(true));
        self.save().await
    }

    /// Move the cursor past the page just persisted.
    ///
    /// `next_page = None` marks the source exhausted for this run.
    pub async fn advance_page(
        &mut self,
        next_page: Option<i64>,
        total_pages: Option<i64>,
    ) -> Result<()> {
        let finished = self.state.current_page;
        if total_pages.is_some() {
            self.state.total_pages = total_pages;
        }

        match next_page {
            Some(page) => {
                self.state.current_page = page;
                self.state.checkpoint = json!({ "last_page": finished });
            }
            None => {
                self.state.checkpoint = json!({ "last_page": finished, "exhausted": true });
            }
        }
        self.save().await
    }

    pub async fn complete(&mut self) -> Result<()> {
        self.state.status = RunStatus::Completed;
        self.state.completed_at = Some(Utc::now());
        self.state.current_operation = "completed".to_string();
        self.state.last_error = None;
        self.save().await
    }

    /// Record a pipeline-fatal failure; the cursor stays where it was
    pub async fn error(&mut self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.state.status = RunStatus::Failed;
        self.state.current_operation = "failed".to_string();
        self.state.last_error = Some(message);
        self.save().await
    }

    /// Leave the run resumable (cancellation, shutdown)
    pub async fn pause(&mut self, reason: impl Into<String>) -> Result<()> {
        self.state.status = RunStatus::Paused;
        self.state.current_operation = reason.into();
        self.save().await
    }

    /// Forget the cursor and counters of a source that is not running.
    ///
    /// `last_error` and the run timestamps are kept.
    pub async fn reset(&mut self) -> Result<()> {
        if let Some(stored) = progress::load(&self.pool, &self.state.source_name).await? {
            self.state = stored;
        }
        if self.state.status == RunStatus::Running {
            return Err(Error::InvalidState(format!(
                "{} is running; cancel it before resetting",
                self.state.source_name
            )));
        }
        self.state.status = RunStatus::Idle;
        self.state.current_operation = "reset".to_string();
        self.clear_cursor(0);
        self.save().await
    }

    fn set_checkpoint_field(&mut self, key: &str, value: Value) {
        if let Some(fields) = self.state.checkpoint.as_object_mut() {
            fields.insert(key.to_string(), value);
        } else {
            self.state.checkpoint = json!({ key: value });
        }
    }

    fn clear_cursor(&mut self, start_page: i64) {
        self.state.current_page = start_page;
        self.state.total_pages = None;
        self.state.current_item = 0;
        self.state.total_items = None;
        self.state.items_processed = 0;
        self.state.items_added = 0;
        self.state.items_updated = 0;
        self.state.items_failed = 0;
        self.state.checkpoint = Value::Null;
    }

    async fn save(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        if let Err(e) = progress::save(&self.pool, &self.state).await {
            warn!(source = %self.state.source_name, error = %e, "Failed to persist progress");
            return Err(e);
        }
        Ok(())
    }
}
