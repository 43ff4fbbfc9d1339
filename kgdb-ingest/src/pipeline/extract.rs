//! Page fetching and JSON-pointer extraction shared by the source pipelines

use chrono::NaiveDate;
use kgdb_common::{Error, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PipelineContext, RawPayload};
use crate::config::ExtractionRule;
use crate::progress::ProgressTracker;

/// Fetch the page at the tracker's cursor, or `None` when the run already
/// consumed the last page
pub async fn fetch_page(
    ctx: &PipelineContext,
    tracker: &mut ProgressTracker,
    cancel: &CancellationToken,
) -> Result<Option<RawPayload>> {
    if tracker.is_exhausted() {
        return Ok(None);
    }

    let rule = &ctx.source.extraction;
    let page = tracker.current_page();
    tracker.set_operation(format!("fetching page {}", page)).await?;

    let mut params: Vec<(String, String)> = ctx
        .source
        .query
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(param) = &rule.page_param {
        params.push((param.clone(), page.to_string()));
    }

    let body = ctx
        .fetch
        .request_with_cancel(&ctx.source.base_url, &params, cancel)
        .await?;

    let item_count = items(rule, &body, &ctx.name)?.len();
    let total_pages = rule
        .total_pages_pointer
        .as_deref()
        .and_then(|p| i64_at(&body, p));
    let next_page = next_page_after(rule, page, &body, total_pages, item_count);

    debug!(
        source = %ctx.name,
        page,
        items = item_count,
        ?next_page,
        ?total_pages,
        "Fetched page"
    );

    Ok(Some(RawPayload {
        page,
        next_page,
        total_pages,
        body,
    }))
}

/// Page following `page`, if the response says there is one
pub fn next_page_after(
    rule: &ExtractionRule,
    page: i64,
    body: &Value,
    total_pages: Option<i64>,
    item_count: usize,
) -> Option<i64> {
    rule.page_param.as_ref()?;

    let next = page + 1;
    if next - rule.start_page >= rule.max_pages {
        warn!(page, max_pages = rule.max_pages, "Pagination limit reached");
        return None;
    }

    if let Some(total) = total_pages {
        return (next < rule.start_page + total).then_some(next);
    }

    match &rule.next_pointer {
        Some(pointer) => match body.pointer(pointer) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(_) => Some(next),
        },
        // Without a marker, an empty page ends the listing
        None => (item_count > 0).then_some(next),
    }
}

/// The item array of a page; a missing or non-array value is a shape error
pub fn items<'a>(rule: &ExtractionRule, body: &'a Value, source: &str) -> Result<&'a [Value]> {
    match body.pointer(&rule.items_pointer) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(Error::upstream(format!(
            "{}: expected an array at '{}', found {}",
            source,
            rule.items_pointer,
            type_name(other)
        ))),
        None => Err(Error::upstream(format!(
            "{}: response has no item list at '{}'",
            source, rule.items_pointer
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Non-empty text at `pointer`; numbers are rendered as text
pub fn text_at(item: &Value, pointer: &str) -> Option<String> {
    match item.pointer(pointer)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn i64_at(item: &Value, pointer: &str) -> Option<i64> {
    match item.pointer(pointer)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn f64_at(item: &Value, pointer: &str) -> Option<f64> {
    let value = match item.pointer(pointer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    value.is_finite().then_some(value)
}

/// Date from a `YYYY-MM-DD` prefix (plain dates and RFC 3339 timestamps)
pub fn date_at(item: &Value, pointer: &str) -> Option<NaiveDate> {
    let text = text_at(item, pointer)?;
    let prefix = text.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

fn max_opt<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Fold the date and score of one item into a group's running maxima
pub fn fold_date_and_score(
    rule: &ExtractionRule,
    item: &Value,
    date: &mut Option<NaiveDate>,
    score: &mut Option<f64>,
) {
    if let Some(pointer) = &rule.date_pointer {
        *date = max_opt(*date, date_at(item, pointer));
    }
    if let Some(pointer) = &rule.score_pointer {
        *score = max_opt(*score, f64_at(item, pointer));
    }
}
