//! Database operations for the ingest core
//!
//! Runtime `sqlx` queries over the schema created by `kgdb_common::db::init`.
//! Functions that must share a transaction take `&mut SqliteConnection`;
//! read-only helpers take the pool.

pub mod evidence;
pub mod genes;
pub mod progress;
pub mod scores;
pub mod staging;

use chrono::{DateTime, SecondsFormat, Utc};
use kgdb_common::{Error, Result};
use serde::de::DeserializeOwned;

/// Fixed-width RFC 3339 so stored timestamps sort lexically
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

pub(crate) fn parse_opt_ts(value: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(&v, column)).transpose()
}

pub(crate) fn parse_json<T: DeserializeOwned>(value: &str, column: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| Error::Internal(format!("Failed to deserialize {}: {}", column, e)))
}
