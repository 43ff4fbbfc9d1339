//! Evidence persistence: resolve, merge, upsert in committed batches

use chrono::Utc;
use futures::FutureExt;
use kgdb_common::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{PersistStats, PipelineContext};
use crate::db::evidence;
use crate::evidence::{merge_into, new_record, EvidenceDraft};
use crate::progress::ProgressTracker;
use crate::resolver::{Mention, Resolution};
use crate::utils::retry_on_lock_default;

/// Resolve and store `drafts`, committing every `persist_batch_size` records.
///
/// Counters are recorded on the tracker after each commit, so a crash loses
/// at most the batch in flight.
pub async fn persist_drafts(
    ctx: &PipelineContext,
    drafts: Vec<EvidenceDraft>,
    tracker: &mut ProgressTracker,
    cancel: &CancellationToken,
) -> Result<PersistStats> {
    let run_id = tracker.state().run_id;
    let mut total = PersistStats::default();

    for chunk in drafts.chunks(ctx.persist_batch_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mentions: Vec<Mention> = chunk
            .iter()
            .map(|d| Mention::new(d.mention.clone()).with_hgnc_id(d.hgnc_id.clone()))
            .collect();
        let resolutions = ctx.resolver.resolve_batch(&ctx.name, &mentions, cancel).await?;

        let batch = retry_on_lock_default("persist_evidence", || {
            write_chunk(ctx, chunk, &resolutions, run_id).boxed()
        })
        .await?;

        tracker
            .record_batch(
                batch.processed as i64,
                batch.added as i64,
                batch.updated as i64,
                batch.rejected as i64,
            )
            .await?;
        total += batch;
    }

    Ok(total)
}

async fn write_chunk(
    ctx: &PipelineContext,
    chunk: &[EvidenceDraft],
    resolutions: &[Resolution],
    run_id: Option<Uuid>,
) -> Result<PersistStats> {
    let mut tx = ctx.pool.begin().await?;
    let now = Utc::now();
    let mut stats = PersistStats::default();

    for (draft, resolution) in chunk.iter().zip(resolutions) {
        stats.processed += 1;
        let gene = match resolution {
            Resolution::MatchedExisting(gene) | Resolution::MatchedExternal(gene) => gene,
            Resolution::Staged { cleaned, .. } => {
                debug!(source = %ctx.name, mention = %cleaned, "Mention staged for review");
                stats.staged += 1;
                continue;
            }
            Resolution::Rejected { reason } => {
                debug!(source = %ctx.name, mention = %draft.mention, reason = %reason, "Mention rejected");
                stats.rejected += 1;
                continue;
            }
        };

        match evidence::find(&mut *tx, gene.id, &ctx.name).await? {
            None => {
                let record = new_record(gene.id, &ctx.name, draft, run_id, now);
                evidence::insert(&mut *tx, &record).await?;
                stats.added += 1;
            }
            Some(existing) => {
                let outcome = merge_into(&existing, draft, run_id, now);
                if !outcome.conflicts.is_empty() {
                    info!(
                        source = %ctx.name,
                        gene_id = %gene.id,
                        symbol = %gene.symbol,
                        conflicts = ?outcome.conflicts,
                        "Merge conflict resolved by policy"
                    );
                }
                if outcome.changed {
                    evidence::update(&mut *tx, &outcome.record).await?;
                    stats.updated += 1;
                } else {
                    stats.unchanged += 1;
                }
            }
        }
    }

    tx.commit().await?;
    Ok(stats)
}
