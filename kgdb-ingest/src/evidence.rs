//! Evidence merge policy
//!
//! A source that re-reports a gene merges into the existing record:
//! - `source_score`: the higher value wins, a value beats no value
//! - `evidence_date`: the most recent date wins, a date beats no date
//! - payload objects merge key by key; arrays are unioned; a null never
//!   replaces a value; differing numbers keep the larger one; any other
//!   disagreement goes to the side with the more recent date
//!
//! Every merge that changes something appends a `MergeEvent` to the record's
//! lineage (capped at `LINEAGE_LIMIT`, oldest dropped first). Disagreements
//! are reported back as conflicts for logging; they are never errors.

use chrono::{DateTime, NaiveDate, Utc};
use kgdb_common::db::{EvidenceRecord, MergeEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

/// Most recent merge events kept per record
pub const LINEAGE_LIMIT: usize = 50;

/// Evidence in canonical shape, before its mention is resolved to a gene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceDraft {
    /// Raw mention text as reported by the source
    pub mention: String,
    /// Canonical identifier when the source supplies one
    pub hgnc_id: Option<String>,
    pub payload: Value,
    pub evidence_date: Option<NaiveDate>,
    pub source_score: Option<f64>,
}

/// Result of merging a draft into a stored record
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: EvidenceRecord,
    pub changed: bool,
    pub conflicts: Vec<String>,
}

/// First record for (gene, source), with a creation entry in its lineage
pub fn new_record(
    gene_id: Uuid,
    source_name: &str,
    draft: &EvidenceDraft,
    run_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> EvidenceRecord {
    EvidenceRecord {
        id: Uuid::new_v4(),
        gene_id,
        source_name: source_name.to_string(),
        payload: draft.payload.clone(),
        evidence_date: draft.evidence_date,
        source_score: draft.source_score,
        lineage: vec![MergeEvent {
            at: now,
            run_id,
            changed_fields: vec!["created".to_string()],
            conflicts: Vec::new(),
        }],
        created_at: now,
        updated_at: now,
    }
}

/// Merge `incoming` into `existing`; identity and creation time never change
pub fn merge_into(
    existing: &EvidenceRecord,
    incoming: &EvidenceDraft,
    run_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut conflicts = Vec::new();
    let prefer_incoming = incoming_is_newer(existing.evidence_date, incoming.evidence_date);

    let payload = merge_values(
        &existing.payload,
        &incoming.payload,
        prefer_incoming,
        "payload",
        &mut conflicts,
    );

    let source_score = match (existing.source_score, incoming.source_score) {
        (Some(old), Some(new)) => {
            if old != new {
                conflicts.push("source_score".to_string());
            }
            Some(old.max(new))
        }
        (old, new) => old.or(new),
    };

    let evidence_date = match (existing.evidence_date, incoming.evidence_date) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => old.or(new),
    };

    let mut changed_fields = Vec::new();
    if payload != existing.payload {
        changed_fields.push("payload".to_string());
    }
    if source_score != existing.source_score {
        changed_fields.push("source_score".to_string());
    }
    if evidence_date != existing.evidence_date {
        changed_fields.push("evidence_date".to_string());
    }

    let changed = !changed_fields.is_empty();
    let mut record = existing.clone();
    if changed {
        record.payload = payload;
        record.source_score = source_score;
        record.evidence_date = evidence_date;
        record.updated_at = now;
        record.lineage.push(MergeEvent {
            at: now,
            run_id,
            changed_fields,
            conflicts: conflicts.clone(),
        });
        if record.lineage.len() > LINEAGE_LIMIT {
            let excess = record.lineage.len() - LINEAGE_LIMIT;
            record.lineage.drain(..excess);
        }
    }

    MergeOutcome {
        record,
        changed,
        conflicts,
    }
}

/// Ties and undated incoming data go to the incoming side, except that an
/// undated report never outranks a dated one
fn incoming_is_newer(existing: Option<NaiveDate>, incoming: Option<NaiveDate>) -> bool {
    match (existing, incoming) {
        (Some(old), Some(new)) => new >= old,
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn merge_values(
    old: &Value,
    new: &Value,
    prefer_new: bool,
    path: &str,
    conflicts: &mut Vec<String>,
) -> Value {
    match (old, new) {
        (_, Value::Null) => old.clone(),
        (Value::Null, _) => new.clone(),
        (Value::Object(a), Value::Object(b)) => {
            let mut merged: Map<String, Value> = a.clone();
            for (key, new_value) in b {
                let value = match a.get(key) {
                    Some(old_value) => merge_values(
                        old_value,
                        new_value,
                        prefer_new,
                        &format!("{}/{}", path, key),
                        conflicts,
                    ),
                    None => new_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (Value::Array(a), Value::Array(b)) => Value::Array(union_arrays(a, b)),
        (Value::Number(a), Value::Number(b)) => {
            if a == b {
                return old.clone();
            }
            conflicts.push(path.to_string());
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) if y > x => new.clone(),
                _ => old.clone(),
            }
        }
        _ if old == new => old.clone(),
        _ => {
            conflicts.push(path.to_string());
            if prefer_new {
                new.clone()
            } else {
                old.clone()
            }
        }
    }
}

/// Union keeping first occurrences; all-scalar arrays come back sorted so the
/// stored form does not depend on arrival order
fn union_arrays(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(a.len() + b.len());
    for item in a.iter().chain(b.iter()) {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }

    if merged.iter().all(|v| v.is_string() || v.is_number()) {
        merged.sort_by(compare_scalars);
    }
    merged
}

fn compare_scalars(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        // Numbers sort before strings
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn draft(payload: Value, evidence_date: Option<NaiveDate>, score: Option<f64>) -> EvidenceDraft {
        EvidenceDraft {
            mention: "PKD1".to_string(),
            hgnc_id: None,
            payload,
            evidence_date,
            source_score: score,
        }
    }

    fn stored(payload: Value, evidence_date: Option<NaiveDate>, score: Option<f64>) -> EvidenceRecord {
        new_record(
            Uuid::new_v4(),
            "clingen",
            &draft(payload, evidence_date, score),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn test_higher_score_newer_date_and_non_null_win() {
        let existing = stored(
            json!({"classifications": ["Moderate"], "mode": null, "label": "old"}),
            Some(date("2021-01-01")),
            Some(0.6),
        );
        let incoming = draft(
            json!({"classifications": ["Definitive"], "mode": "AD", "label": null}),
            Some(date("2023-05-01")),
            Some(1.0),
        );

        let outcome = merge_into(&existing, &incoming, None, Utc::now());
        assert!(outcome.changed);
        let record = outcome.record;
        assert_eq!(record.id, existing.id);
        assert_eq!(record.source_score, Some(1.0));
        assert_eq!(record.evidence_date, Some(date("2023-05-01")));
        assert_eq!(
            record.payload,
            json!({"classifications": ["Definitive", "Moderate"], "mode": "AD", "label": "old"})
        );
        assert_eq!(record.lineage.len(), 2);
        assert_eq!(
            record.lineage[1].changed_fields,
            vec!["payload", "source_score", "evidence_date"]
        );
    }

    #[test]
    fn test_lower_score_and_older_date_do_not_regress() {
        let existing = stored(json!({"count": 5}), Some(date("2023-01-01")), Some(0.9));
        let incoming = draft(json!({"count": 3}), Some(date("2020-01-01")), Some(0.2));

        let outcome = merge_into(&existing, &incoming, None, Utc::now());
        assert!(!outcome.changed);
        assert_eq!(outcome.record, existing);
        assert_eq!(outcome.conflicts, vec!["payload/count", "source_score"]);
    }

    #[test]
    fn test_null_score_is_filled() {
        let existing = stored(json!({}), None, None);
        let incoming = draft(json!({}), None, Some(0.4));
        let outcome = merge_into(&existing, &incoming, None, Utc::now());
        assert_eq!(outcome.record.source_score, Some(0.4));
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_scalar_conflict_goes_to_newer_report() {
        let existing = stored(json!({"mode": "AR"}), Some(date("2022-01-01")), None);

        let older = draft(json!({"mode": "AD"}), Some(date("2021-01-01")), None);
        assert_eq!(
            merge_into(&existing, &older, None, Utc::now()).record.payload,
            json!({"mode": "AR"})
        );

        let newer = draft(json!({"mode": "AD"}), Some(date("2024-01-01")), None);
        assert_eq!(
            merge_into(&existing, &newer, None, Utc::now()).record.payload,
            json!({"mode": "AD"})
        );
    }

    #[test]
    fn test_identical_report_is_a_no_op() {
        let existing = stored(json!({"keys": ["p1", "p2"], "count": 2}), Some(date("2022-01-01")), None);
        let same = draft(json!({"keys": ["p2", "p1"], "count": 2}), Some(date("2022-01-01")), None);
        let outcome = merge_into(&existing, &same, None, Utc::now());
        assert!(!outcome.changed);
        assert_eq!(outcome.record.lineage.len(), 1);
    }

    #[test]
    fn test_lineage_is_capped() {
        let mut record = stored(json!({"n": 0}), None, None);
        for n in 1..=(LINEAGE_LIMIT as i64 + 10) {
            record = merge_into(&record, &draft(json!({"n": n}), None, None), None, Utc::now()).record;
        }
        assert_eq!(record.lineage.len(), LINEAGE_LIMIT);
        assert_eq!(record.payload, json!({"n": LINEAGE_LIMIT as i64 + 10}));
        assert!(record.lineage.iter().all(|e| e.changed_fields == vec!["payload"]));
    }

    #[test]
    fn test_union_sorts_scalars() {
        assert_eq!(
            union_arrays(&[json!("b"), json!(2)], &[json!("a"), json!(1), json!("b")]),
            vec![json!(1), json!(2), json!("a"), json!("b")]
        );
    }
}
