//! Database models
//!
//! Row types shared by the ingest core and every reader of the database.
//! JSON-valued columns (payloads, logs, checkpoints) are stored as TEXT.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Canonical gene identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gene {
    pub id: Uuid,
    /// Stable external identifier (e.g. `HGNC:9008`), immutable once assigned
    pub hgnc_id: String,
    /// Current approved symbol, may change over time
    pub symbol: String,
    /// Alias and previous symbols, upper-cased, sorted, deduplicated
    pub aliases: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One merge applied to an evidence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub at: DateTime<Utc>,
    /// Run that produced the incoming data (if known)
    pub run_id: Option<Uuid>,
    /// Top-level fields whose stored value changed
    pub changed_fields: Vec<String>,
    /// Fields where both sides were set and disagreed
    pub conflicts: Vec<String>,
}

/// One fact asserted by one source about one gene.
///
/// At most one row exists per (gene, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: Uuid,
    pub gene_id: Uuid,
    pub source_name: String,
    pub payload: serde_json::Value,
    pub evidence_date: Option<NaiveDate>,
    pub source_score: Option<f64>,
    pub lineage: Vec<MergeEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Review status of a staged mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingStatus {
    Pending,
    Approved,
    Rejected,
    Duplicate,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStatus::Pending => "pending",
            StagingStatus::Approved => "approved",
            StagingStatus::Rejected => "rejected",
            StagingStatus::Duplicate => "duplicate",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StagingStatus::Pending)
    }
}

impl FromStr for StagingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StagingStatus::Pending),
            "approved" => Ok(StagingStatus::Approved),
            "rejected" => Ok(StagingStatus::Rejected),
            "duplicate" => Ok(StagingStatus::Duplicate),
            other => Err(Error::Internal(format!("Unknown staging status: {}", other))),
        }
    }
}

impl fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a staging entry's append-only resolution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAttempt {
    pub at: DateTime<Utc>,
    pub source_name: String,
    pub strategy: String,
    pub outcome: String,
}

/// A gene mention awaiting (or having received) human review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingEntry {
    pub id: Uuid,
    pub original_text: String,
    pub cleaned_text: String,
    /// Source that first reported the mention
    pub source_name: String,
    /// Mentions per reporting source (highest count seen in one resolution batch)
    pub source_mentions: BTreeMap<String, i64>,
    /// Sum of `source_mentions`
    pub mention_count: i64,
    pub attempt_log: Vec<ResolutionAttempt>,
    pub status: StagingStatus,
    pub priority_score: f64,
    pub approved_symbol: Option<String>,
    pub approved_hgnc_id: Option<String>,
    pub approved_aliases: Vec<String>,
    pub linked_gene_id: Option<Uuid>,
    pub reviewer: Option<String>,
    pub review_notes: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Run status of a source pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(RunStatus::Idle),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "paused" => Ok(RunStatus::Paused),
            other => Err(Error::Internal(format!("Unknown run status: {}", other))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted run state of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub source_name: String,
    pub status: RunStatus,
    pub run_id: Option<Uuid>,
    /// Next page to fetch; pages before it are fully persisted
    pub current_page: i64,
    pub total_pages: Option<i64>,
    pub current_item: i64,
    pub total_items: Option<i64>,
    pub items_processed: i64,
    pub items_added: i64,
    pub items_updated: i64,
    pub items_failed: i64,
    pub current_operation: String,
    pub last_error: Option<String>,
    /// Free-form resume metadata written by the pipeline
    pub checkpoint: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressState {
    /// Fresh idle state for a source that has never run
    pub fn idle(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            status: RunStatus::Idle,
            run_id: None,
            current_page: 0,
            total_pages: None,
            current_item: 0,
            total_items: None,
            items_processed: 0,
            items_added: 0,
            items_updated: 0,
            items_failed: 0,
            current_operation: String::new(),
            last_error: None,
            checkpoint: serde_json::Value::Null,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Derived per-gene score, recomputable from evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub gene_id: Uuid,
    pub symbol: String,
    pub hgnc_id: String,
    /// Normalized value (0-1) per source that has evidence for the gene
    pub per_source: BTreeMap<String, f64>,
    /// Weighted combination on a 0-100 scale
    pub combined_score: f64,
    pub source_count: i64,
    pub evidence_count: i64,
    pub computed_at: DateTime<Utc>,
}

/// Parse a UUID stored as TEXT
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid UUID '{}': {}", value, e)))
}
