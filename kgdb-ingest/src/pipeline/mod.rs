//! Source pipelines
//!
//! Every external source implements `SourcePipeline`: fetch one raw page,
//! transform it into evidence drafts (pure), persist them. `run_pipeline`
//! drives that loop page by page under a `ProgressTracker`, so a run can be
//! resumed from the first page that was not fully persisted.

pub mod classification_source;
pub mod count_source;
pub mod extract;
pub mod registry;
pub mod writer;

pub use classification_source::ClassificationSourcePipeline;
pub use count_source::CountSourcePipeline;
pub use registry::PipelineRegistry;

use async_trait::async_trait;
use kgdb_common::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SourceConfig, SourceKind};
use crate::evidence::EvidenceDraft;
use crate::fetch::FetchClient;
use crate::progress::ProgressTracker;
use crate::resolver::GeneResolver;

/// One fetched page of a source
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub page: i64,
    /// Page to fetch after this one, `None` when this was the last
    pub next_page: Option<i64>,
    pub total_pages: Option<i64>,
    pub body: Value,
}

/// Drafts produced from one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub records: Vec<EvidenceDraft>,
    /// Items without the fields the source needs
    pub skipped: usize,
}

/// Outcome of persisting a set of drafts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub processed: usize,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub staged: usize,
    pub rejected: usize,
}

impl std::ops::AddAssign for PersistStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.added += other.added;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.staged += other.staged;
        self.rejected += other.rejected;
    }
}

/// Totals of one pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub pages: usize,
    pub skipped: usize,
    #[serde(flatten)]
    pub persisted: PersistStats,
    /// The source was already running; nothing was done
    pub skipped_run: bool,
}

/// Everything a pipeline needs from the outside world
#[derive(Clone)]
pub struct PipelineContext {
    pub name: String,
    pub source: SourceConfig,
    pub pool: SqlitePool,
    pub fetch: FetchClient,
    pub resolver: Arc<GeneResolver>,
    /// Evidence records per transaction
    pub persist_batch_size: usize,
}

#[async_trait]
pub trait SourcePipeline: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Page a fresh (non-resumed) run starts from
    fn start_page(&self) -> i64;

    fn pool(&self) -> &SqlitePool;

    /// Fetch the page at the tracker's cursor; `None` once the source is exhausted
    async fn fetch_raw(
        &self,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<Option<RawPayload>>;

    /// Pure conversion of one page into evidence drafts.
    ///
    /// Malformed items are skipped and counted; an error means the page as a
    /// whole does not have the expected shape.
    fn transform(&self, raw: &RawPayload) -> Result<TransformOutput>;

    /// Resolve and upsert drafts in batches, one transaction per batch
    async fn persist(
        &self,
        records: Vec<EvidenceDraft>,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<PersistStats>;

    /// Full run: see `run_pipeline`
    async fn run(&self, resume: bool, cancel: &CancellationToken) -> Result<RunStats> {
        run_pipeline(self, resume, cancel).await
    }
}

/// Run `pipeline` to completion.
///
/// Refuses (returning `skipped_run`) when the source is already running.
/// Cancellation leaves the source `paused`; any other error marks it
/// `failed` with the error text. Both are returned to the caller.
pub async fn run_pipeline<P>(
    pipeline: &P,
    resume: bool,
    cancel: &CancellationToken,
) -> Result<RunStats>
where
    P: SourcePipeline + ?Sized,
{
    let source = pipeline.name().to_string();
    let run_id = Uuid::new_v4();
    let mut tracker = ProgressTracker::load(pipeline.pool().clone(), &source).await?;

    if !tracker.start(run_id, resume, pipeline.start_page()).await? {
        info!(source = %source, "Run already in progress, not starting another");
        return Ok(RunStats {
            skipped_run: true,
            ..RunStats::default()
        });
    }

    info!(
        source = %source,
        %run_id,
        resume,
        page = tracker.current_page(),
        "Pipeline run started"
    );

    match drive(pipeline, &mut tracker, cancel).await {
        Ok(stats) => {
            tracker.complete().await?;
            info!(
                source = %source,
                %run_id,
                pages = stats.pages,
                added = stats.persisted.added,
                updated = stats.persisted.updated,
                unchanged = stats.persisted.unchanged,
                staged = stats.persisted.staged,
                skipped = stats.skipped,
                "Pipeline run completed"
            );
            Ok(stats)
        }
        Err(Error::Cancelled) => {
            if let Err(e) = tracker.pause("cancelled").await {
                error!(source = %source, error = %e, "Failed to record cancellation");
            }
            warn!(source = %source, page = tracker.current_page(), "Pipeline run cancelled");
            Err(Error::Cancelled)
        }
        Err(err) => {
            error!(source = %source, %run_id, error = %err, "Pipeline run failed");
            if let Err(e) = tracker.error(err.to_string()).await {
                error!(source = %source, error = %e, "Failed to record run failure");
            }
            Err(err)
        }
    }
}

async fn drive<P>(
    pipeline: &P,
    tracker: &mut ProgressTracker,
    cancel: &CancellationToken,
) -> Result<RunStats>
where
    P: SourcePipeline + ?Sized,
{
    let mut stats = RunStats::default();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let Some(raw) = pipeline.fetch_raw(tracker, cancel).await? else {
            break;
        };
        stats.pages += 1;

        let output = pipeline.transform(&raw)?;
        if output.skipped > 0 {
            warn!(
                source = %pipeline.name(),
                page = raw.page,
                skipped = output.skipped,
                "Skipped malformed items"
            );
            tracker.record_skipped(output.skipped as i64).await?;
            stats.skipped += output.skipped;
        }

        let mut records = output.records;
        let committed = tracker.persisted_on_page().min(records.len());
        if committed > 0 {
            info!(
                source = %pipeline.name(),
                page = raw.page,
                committed,
                "Continuing page after records committed by the interrupted run"
            );
            records.drain(..committed);
        }

        stats.persisted += pipeline.persist(records, tracker, cancel).await?;
        tracker.advance_page(raw.next_page, raw.total_pages).await?;

        if raw.next_page.is_none() {
            break;
        }
    }

    Ok(stats)
}
