//! Decision-record streaming: malformed-line accounting, filters,
//! pagination, summaries, and decision-derived projections.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::ResolveError;

// ---------------------------------------------------------------------------
// Streaming reader
// ---------------------------------------------------------------------------

/// Line-by-line JSONL reader that drops blank and malformed lines while
/// counting the malformed ones.
pub struct DecisionRecords {
    path: PathBuf,
}

impl DecisionRecords {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Read all well-formed records; returns `(records, malformed_count)`.
    pub fn read_all(&self) -> Result<(Vec<Value>, u64), ResolveError> {
        let file = File::open(&self.path).map_err(|_| {
            ResolveError::new(404, "decision_records_missing", "decision_records.jsonl missing")
        })?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut malformed: u64 = 0;
        for line in reader.lines() {
            let line = line.map_err(|e| {
                ResolveError::new(422, "decision_records_invalid", e.to_string())
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => records.push(Value::Object(map)),
                Ok(_) | Err(_) => malformed += 1,
            }
        }
        Ok((records, malformed))
    }
}

/// Fail-closed gate: `Some(count)` when the file contains malformed lines.
pub fn validate_decision_records(path: &Path) -> Result<Option<u64>, ResolveError> {
    let (_, malformed) = DecisionRecords::new(path).read_all()?;
    Ok((malformed > 0).then_some(malformed))
}

// ---------------------------------------------------------------------------
// Filters & pagination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DecisionFilter {
    pub symbols: Option<Vec<String>>,
    pub actions: Option<Vec<String>>,
    pub severities: Option<Vec<String>>,
    pub reason_codes: Option<Vec<String>>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// 1-based page number.
    pub page: u64,
    /// 1..=500 rows per page.
    pub page_size: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

/// Filtered, paginated decisions: `{total, page, page_size, results}`.
pub fn filter_decisions(
    path: &Path,
    filter: &DecisionFilter,
    page: Page,
) -> Result<Value, ResolveError> {
    let (records, _) = DecisionRecords::new(path).read_all()?;

    let offset = page.page.saturating_sub(1) * page.page_size;
    let mut total: u64 = 0;
    let mut results: Vec<Value> = Vec::new();

    for record in records {
        if !matches_filters(&record, filter) {
            continue;
        }
        total += 1;
        if total <= offset {
            continue;
        }
        if (results.len() as u64) < page.page_size {
            results.push(normalize_record(record));
        }
    }

    Ok(json!({
        "total": total,
        "page": page.page,
        "page_size": page.page_size,
        "results": results,
    }))
}

fn matches_filters(record: &Value, filter: &DecisionFilter) -> bool {
    if let Some(symbols) = &filter.symbols {
        match record.get("symbol").and_then(Value::as_str) {
            Some(symbol) if symbols.iter().any(|s| s == symbol) => {}
            _ => return false,
        }
    }
    if let Some(actions) = &filter.actions {
        match record.get("action").and_then(Value::as_str) {
            Some(action) if actions.iter().any(|a| a == action) => {}
            _ => return false,
        }
    }
    if let Some(severities) = &filter.severities {
        match severity_of(record) {
            Some(severity) if severities.iter().any(|s| *s == severity) => {}
            _ => return false,
        }
    }
    if let Some(reasons) = &filter.reason_codes {
        let value = record
            .get("reason_code")
            .or_else(|| record.get("reason"))
            .and_then(Value::as_str);
        match value {
            Some(reason) if reasons.iter().any(|r| r == reason) => {}
            _ => return false,
        }
    }
    if filter.start_ts.is_some() || filter.end_ts.is_some() {
        let ts = match record_ts(record) {
            Some(ts) => ts,
            None => return false,
        };
        if let Some(start) = filter.start_ts {
            if ts < start {
                return false;
            }
        }
        if let Some(end) = filter.end_ts {
            if ts > end {
                return false;
            }
        }
    }
    true
}

fn severity_of(record: &Value) -> Option<String> {
    record
        .get("severity")
        .or_else(|| record.get("risk_state"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Records carry `ts_utc` (current schema) or `timestamp` (legacy).
fn record_ts(record: &Value) -> Option<DateTime<Utc>> {
    let raw = record
        .get("ts_utc")
        .or_else(|| record.get("timestamp"))?;
    match raw {
        Value::String(s) => buff_time::parse_ts(s).ok(),
        Value::Number(n) => n.as_i64().and_then(|ms| buff_time::from_epoch_ms(ms).ok()),
        _ => None,
    }
}

/// Canonical UTC-Z rendition of whichever timestamp key the record uses.
pub(crate) fn normalize_record(record: Value) -> Value {
    let mut map = match record {
        Value::Object(map) => map,
        other => return other,
    };
    for key in ["ts_utc", "timestamp"] {
        if let Some(ts) = map.get(key).cloned() {
            let parsed = match &ts {
                Value::String(s) => buff_time::parse_ts(s).ok(),
                Value::Number(n) => n.as_i64().and_then(|ms| buff_time::from_epoch_ms(ms).ok()),
                _ => None,
            };
            if let Some(parsed) = parsed {
                map.insert(key.to_string(), json!(buff_time::format_ts(parsed)));
            }
        }
    }
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Summaries & projections
// ---------------------------------------------------------------------------

/// Aggregate over the full decision stream.
pub fn build_summary(path: &Path) -> Result<Value, ResolveError> {
    let (records, malformed) = DecisionRecords::new(path).read_all()?;

    let mut counts_by_action: BTreeMap<String, u64> = BTreeMap::new();
    let mut counts_by_severity: BTreeMap<String, u64> = BTreeMap::new();
    let mut min_ts: Option<DateTime<Utc>> = None;
    let mut max_ts: Option<DateTime<Utc>> = None;

    for record in &records {
        if let Some(action) = record.get("action").and_then(Value::as_str) {
            *counts_by_action.entry(action.to_string()).or_insert(0) += 1;
        }
        if let Some(severity) = severity_of(record) {
            *counts_by_severity.entry(severity).or_insert(0) += 1;
        }
        if let Some(ts) = record_ts(record) {
            min_ts = Some(min_ts.map_or(ts, |m| m.min(ts)));
            max_ts = Some(max_ts.map_or(ts, |m| m.max(ts)));
        }
    }

    Ok(json!({
        "min_timestamp": min_ts.map(buff_time::format_ts),
        "max_timestamp": max_ts.map(buff_time::format_ts),
        "counts_by_action": counts_by_action,
        "counts_by_severity": counts_by_severity,
        "malformed_lines_count": malformed,
    }))
}

/// Error-grade records (severity ERROR / FAIL_CLOSED variants).
pub fn collect_error_records(path: &Path) -> Result<Vec<Value>, ResolveError> {
    let (records, _) = DecisionRecords::new(path).read_all()?;
    Ok(records
        .into_iter()
        .filter(|record| {
            let severity = severity_of(record).unwrap_or_default().to_ascii_uppercase();
            matches!(
                severity.as_str(),
                "ERROR" | "FAIL_CLOSED" | "FAIL-CLOSED" | "FAILCLOSED"
            )
        })
        .map(normalize_record)
        .collect())
}

/// Synthesize timeline events from decisions when no timeline artifact
/// exists (one event per non-HOLD decision).
pub fn build_timeline_from_decisions(path: &Path) -> Result<Vec<Value>, ResolveError> {
    let (records, _) = DecisionRecords::new(path).read_all()?;
    let mut events = Vec::new();
    let mut seq: u64 = 0;
    for record in records {
        let action = record
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if action == "HOLD" || action.is_empty() {
            continue;
        }
        let ts = record_ts(&record)
            .map(buff_time::format_ts)
            .unwrap_or_default();
        let mut event = Map::new();
        event.insert("timestamp".to_string(), json!(ts));
        event.insert("type".to_string(), json!("decision"));
        event.insert("title".to_string(), json!(action));
        event.insert(
            "detail".to_string(),
            json!(format!(
                "action={action} price={}",
                record.get("price").cloned().unwrap_or(Value::Null)
            )),
        );
        event.insert("severity".to_string(), json!("INFO"));
        event.insert("stage".to_string(), json!("EXECUTION"));
        event.insert("duration_ms".to_string(), json!(0));
        event.insert("seq".to_string(), json!(seq));
        seq += 1;
        events.push(Value::Object(event));
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn decisions_file(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("decision_records.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    fn record(seq: u64, action: &str, ts: &str) -> String {
        format!(
            "{{\"seq\":{seq},\"action\":\"{action}\",\"ts_utc\":\"{ts}\",\"symbol\":\"BTCUSDT\",\"price\":1.0}}"
        )
    }

    #[test]
    fn malformed_lines_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = decisions_file(
            dir.path(),
            &[
                &record(0, "HOLD", "2024-01-01T00:00:00.000Z"),
                "{ not json",
                "",
                "[1,2,3]",
                &record(1, "ENTER_LONG", "2024-01-01T00:01:00.000Z"),
            ],
        );
        let (records, malformed) = DecisionRecords::new(&path).read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(malformed, 2);
        assert_eq!(validate_decision_records(&path).unwrap(), Some(2));
    }

    #[test]
    fn clean_file_validates_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = decisions_file(dir.path(), &[&record(0, "HOLD", "2024-01-01T00:00:00.000Z")]);
        assert_eq!(validate_decision_records(&path).unwrap(), None);
    }

    #[test]
    fn missing_file_is_404_code() {
        let dir = tempfile::tempdir().unwrap();
        let err = DecisionRecords::new(&dir.path().join("absent.jsonl"))
            .read_all()
            .unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.code, "decision_records_missing");
    }

    #[test]
    fn filters_and_pagination_compose() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..10)
            .map(|i| {
                let action = if i % 2 == 0 { "HOLD" } else { "ENTER_LONG" };
                record(i, action, &format!("2024-01-01T00:0{}:00.000Z", i % 10))
            })
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let path = decisions_file(dir.path(), &refs);

        let filter = DecisionFilter {
            actions: Some(vec!["ENTER_LONG".to_string()]),
            ..Default::default()
        };
        let page = Page {
            page: 2,
            page_size: 2,
        };
        let result = filter_decisions(&path, &filter, page).unwrap();
        assert_eq!(result["total"], 5);
        assert_eq!(result["results"].as_array().unwrap().len(), 2);
        assert_eq!(result["results"][0]["seq"], 5);
    }

    #[test]
    fn time_window_filter_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = decisions_file(
            dir.path(),
            &[
                &record(0, "HOLD", "2024-01-01T00:00:00.000Z"),
                &record(1, "HOLD", "2024-01-01T00:05:00.000Z"),
                &record(2, "HOLD", "2024-01-01T00:10:00.000Z"),
            ],
        );
        let filter = DecisionFilter {
            start_ts: buff_time::parse_ts("2024-01-01T00:04:00Z").ok(),
            end_ts: buff_time::parse_ts("2024-01-01T00:09:00Z").ok(),
            ..Default::default()
        };
        let result = filter_decisions(&path, &filter, Page::default()).unwrap();
        assert_eq!(result["total"], 1);
        assert_eq!(result["results"][0]["seq"], 1);
    }

    #[test]
    fn summary_counts_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = decisions_file(
            dir.path(),
            &[
                &record(0, "ENTER_LONG", "2024-01-01T00:00:00.000Z"),
                &record(1, "HOLD", "2024-01-01T00:01:00.000Z"),
                &record(2, "HOLD", "2024-01-01T00:02:00.000Z"),
                "{ bad",
            ],
        );
        let summary = build_summary(&path).unwrap();
        assert_eq!(summary["counts_by_action"]["HOLD"], 2);
        assert_eq!(summary["counts_by_action"]["ENTER_LONG"], 1);
        assert_eq!(summary["min_timestamp"], "2024-01-01T00:00:00.000Z");
        assert_eq!(summary["max_timestamp"], "2024-01-01T00:02:00.000Z");
        assert_eq!(summary["malformed_lines_count"], 1);
    }

    #[test]
    fn timeline_from_decisions_skips_holds() {
        let dir = tempfile::tempdir().unwrap();
        let path = decisions_file(
            dir.path(),
            &[
                &record(0, "ENTER_LONG", "2024-01-01T00:00:00.000Z"),
                &record(1, "HOLD", "2024-01-01T00:01:00.000Z"),
                &record(2, "EXIT_LONG", "2024-01-01T00:02:00.000Z"),
            ],
        );
        let events = build_timeline_from_decisions(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["title"], "ENTER_LONG");
        assert_eq!(events[1]["seq"], 1);
    }

    #[test]
    fn legacy_timestamp_key_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = decisions_file(
            dir.path(),
            &["{\"seq\":0,\"action\":\"HOLD\",\"timestamp\":1704067200000}"],
        );
        let result = filter_decisions(&path, &DecisionFilter::default(), Page::default()).unwrap();
        assert_eq!(
            result["results"][0]["timestamp"],
            "2024-01-01T00:00:00.000Z"
        );
    }
}
