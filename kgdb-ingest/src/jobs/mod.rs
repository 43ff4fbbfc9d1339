//! Background ingestion jobs
//!
//! Jobs are named `ingest:<source>`, `ingest:all` or `score`. Each runs on
//! the supervisor's `TaskTracker` under a child of the shutdown token, so
//! cancelling one job or shutting the process down leaves every running
//! source `paused` and resumable. Rate-limited source runs are retried
//! after `jobs.rate_limit_retry_secs`, resuming from their checkpoint.
//! A run that changed anything is followed by a score recompute.

pub mod executor;

pub use executor::JobExecutor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use kgdb_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::pipeline::RunStats;

/// Finished jobs kept for status queries
const MAX_RETAINED_JOBS: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Use cached responses where still fresh
    #[default]
    Incremental,
    /// Drop the source's cached responses and start from the first page
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobArgs {
    pub source_name: Option<String>,
    pub mode: RunMode,
    /// Continue a paused or failed run from its checkpoint
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Source(String),
    AllSources,
    Score,
}

impl JobKind {
    pub fn parse(job_name: &str, args: &JobArgs) -> Result<Self> {
        let arg_source = args
            .source_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match job_name.trim() {
            "score" => Ok(JobKind::Score),
            "ingest:all" => Ok(JobKind::AllSources),
            "ingest" => arg_source
                .map(|s| JobKind::Source(s.to_string()))
                .ok_or_else(|| Error::InvalidInput("ingest needs a source_name".to_string())),
            name => match name.strip_prefix("ingest:") {
                Some(source) if !source.is_empty() => {
                    if let Some(arg) = arg_source {
                        if arg != source {
                            return Err(Error::InvalidInput(format!(
                                "Job {} does not match source_name {}",
                                name, arg
                            )));
                        }
                    }
                    Ok(JobKind::Source(source.to_string()))
                }
                _ => Err(Error::InvalidInput(format!("Unknown job {}", name))),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub name: String,
    pub args: JobArgs,
    pub status: JobStatus,
    /// Rate-limit retries so far
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-source run totals and the recompute summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_name: &str, args: JobArgs) -> Result<Uuid>;

    async fn status(&self, job_id: Uuid) -> Result<JobInfo>;

    /// Request cancellation; the job reaches `cancelled` once its task stops
    async fn cancel(&self, job_id: Uuid) -> Result<JobInfo>;
}

struct JobEntry {
    info: JobInfo,
    cancel: CancellationToken,
}

struct Inner {
    executor: Arc<dyn JobExecutor>,
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Inner {
    async fn update(&self, id: Uuid, f: impl FnOnce(&mut JobInfo)) {
        if let Some(entry) = self.jobs.write().await.get_mut(&id) {
            f(&mut entry.info);
        }
    }
}

/// In-process job queue
#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<Inner>,
}

impl JobSupervisor {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                jobs: RwLock::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Known jobs, newest first
    pub async fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Cancel every job and wait for their tasks to finish
    pub async fn shutdown(&self) {
        info!(running = self.inner.tracker.len(), "Stopping background jobs");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

#[async_trait]
impl JobQueue for JobSupervisor {
    async fn enqueue(&self, job_name: &str, args: JobArgs) -> Result<Uuid> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::InvalidState("Shutting down".to_string()));
        }
        let kind = JobKind::parse(job_name, &args)?;
        if let JobKind::Source(source) = &kind {
            if !self.inner.executor.source_names()?.contains(source) {
                return Err(Error::NotFound(format!(
                    "Source {} is unknown or disabled",
                    source
                )));
            }
        }

        let id = Uuid::new_v4();
        let cancel = self.inner.shutdown.child_token();
        let info = JobInfo {
            id,
            name: job_name.trim().to_string(),
            args: args.clone(),
            status: JobStatus::Queued,
            retries: 0,
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            prune_finished(&mut jobs);
            jobs.insert(
                id,
                JobEntry {
                    info,
                    cancel: cancel.clone(),
                },
            );
        }
        info!(job_id = %id, job = job_name, mode = ?args.mode, resume = args.resume, "Job queued");

        let inner = self.inner.clone();
        self.inner
            .tracker
            .spawn(async move { run_job(inner, id, kind, args, cancel).await });
        Ok(id)
    }

    async fn status(&self, job_id: Uuid) -> Result<JobInfo> {
        self.inner
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<JobInfo> {
        let jobs = self.inner.jobs.read().await;
        let entry = jobs
            .get(&job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        if entry.info.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Job {} already finished",
                job_id
            )));
        }
        entry.cancel.cancel();
        info!(job_id = %job_id, job = %entry.info.name, "Job cancellation requested");
        Ok(entry.info.clone())
    }
}

/// Drop the oldest finished jobs once the table is full
fn prune_finished(jobs: &mut HashMap<Uuid, JobEntry>) {
    if jobs.len() < MAX_RETAINED_JOBS {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|entry| entry.info.status.is_terminal())
        .map(|entry| (entry.info.finished_at.unwrap_or(entry.info.created_at), entry.info.id))
        .collect();
    finished.sort();
    let excess = jobs.len() + 1 - MAX_RETAINED_JOBS;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

/// Result of a job that ran to the end, possibly with some sources failing
struct JobReport {
    result: Value,
    failures: Vec<String>,
}

async fn run_job(
    inner: Arc<Inner>,
    id: Uuid,
    kind: JobKind,
    args: JobArgs,
    cancel: CancellationToken,
) {
    if cancel.is_cancelled() {
        inner
            .update(id, |info| {
                info.status = JobStatus::Cancelled;
                info.finished_at = Some(Utc::now());
            })
            .await;
        return;
    }

    inner
        .update(id, |info| {
            info.status = JobStatus::Running;
            info.started_at = Some(Utc::now());
        })
        .await;
    info!(job_id = %id, kind = ?kind, "Job started");

    let outcome = execute(&inner, id, &kind, &args, &cancel).await;

    match outcome {
        Ok(report) if report.failures.is_empty() => {
            info!(job_id = %id, kind = ?kind, "Job completed");
            inner
                .update(id, |info| {
                    info.status = JobStatus::Done;
                    info.error = None;
                    info.result = Some(report.result);
                    info.finished_at = Some(Utc::now());
                })
                .await;
        }
        Ok(report) => {
            let message = report.failures.join("; ");
            warn!(job_id = %id, failures = %message, "Job finished with failed sources");
            inner
                .update(id, |info| {
                    info.status = JobStatus::Failed;
                    info.error = Some(message);
                    info.result = Some(report.result);
                    info.finished_at = Some(Utc::now());
                })
                .await;
        }
        Err(Error::Cancelled) => {
            warn!(job_id = %id, kind = ?kind, "Job cancelled");
            inner
                .update(id, |info| {
                    info.status = JobStatus::Cancelled;
                    info.finished_at = Some(Utc::now());
                })
                .await;
        }
        Err(e) => {
            error!(job_id = %id, kind = ?kind, error = %e, "Job failed");
            inner
                .update(id, |info| {
                    info.status = JobStatus::Failed;
                    info.error = Some(e.to_string());
                    info.finished_at = Some(Utc::now());
                })
                .await;
        }
    }
}

async fn execute(
    inner: &Inner,
    id: Uuid,
    kind: &JobKind,
    args: &JobArgs,
    cancel: &CancellationToken,
) -> Result<JobReport> {
    let config = inner.executor.jobs_config()?;

    let names = match kind {
        JobKind::Score => {
            let scoring = inner.executor.recompute_scores().await?;
            return Ok(JobReport {
                result: json!({ "scoring": scoring }),
                failures: Vec::new(),
            });
        }
        JobKind::Source(source) => vec![source.clone()],
        JobKind::AllSources => inner.executor.source_names()?,
    };

    let config_ref = &config;
    let results: Vec<(String, Result<RunStats>)> = stream::iter(names)
        .map(|source| {
            async move {
                let result = run_with_retry(inner, id, &source, args, config_ref, cancel).await;
                (source, result)
            }
            .boxed()
        })
        .buffer_unordered(config.max_parallel_sources.max(1))
        .collect()
        .await;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut sources = serde_json::Map::new();
    let mut failures = Vec::new();
    let mut changed = false;
    for (source, result) in results {
        match result {
            Ok(stats) => {
                changed |= !stats.skipped_run;
                sources.insert(source, json!(stats));
            }
            // A single-source job reports its error directly
            Err(e) if matches!(kind, JobKind::Source(_)) => return Err(e),
            Err(e) => {
                failures.push(format!("{}: {}", source, e));
                sources.insert(source, json!({ "error": e.to_string() }));
            }
        }
    }

    let scoring = if changed {
        Some(inner.executor.recompute_scores().await?)
    } else {
        None
    };

    Ok(JobReport {
        result: json!({ "sources": sources, "scoring": scoring }),
        failures,
    })
}

/// Run one source, retrying rate-limited failures from their checkpoint
async fn run_with_retry(
    inner: &Inner,
    id: Uuid,
    source: &str,
    args: &JobArgs,
    config: &JobsConfig,
    cancel: &CancellationToken,
) -> Result<RunStats> {
    let full = args.mode == RunMode::Full;
    if full {
        inner.executor.prepare_full_run(source).await;
    }
    let mut resume = args.resume && !full;
    let mut retries = 0;

    loop {
        match inner.executor.run_source(source, resume, cancel).await {
            Err(e) if e.is_rate_limited() && retries < config.max_job_retries => {
                retries += 1;
                let message = e.to_string();
                warn!(
                    job_id = %id,
                    source,
                    retries,
                    delay_secs = config.rate_limit_retry_secs,
                    error = %message,
                    "Source rate limited, retrying"
                );
                inner
                    .update(id, |info| {
                        info.retries += 1;
                        info.error = Some(message);
                    })
                    .await;

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(config.rate_limit_retry_secs)) => {}
                }
                resume = true;
            }
            other => return other,
        }
    }
}
