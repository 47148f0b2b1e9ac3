//! Whole-file readers: trades, OHLCV, metrics, timeline.
//!
//! Writers emit JSONL only; a run whose trades exist solely as legacy
//! Parquet is reported missing rather than half-read.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::decisions::{normalize_record, Page};
use crate::ResolveError;

fn read_jsonl(path: &Path, code_missing: &str, code_invalid: &str) -> Result<Vec<Value>, ResolveError> {
    let text = fs::read_to_string(path).map_err(|_| {
        ResolveError::new(404, code_missing, format!("{code_missing} artifact"))
    })?;
    let mut rows = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|e| {
            ResolveError::new(422, code_invalid, e.to_string())
        })?;
        rows.push(value);
    }
    Ok(rows)
}

fn row_ts(row: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        if let Some(value) = row.get(*key) {
            let parsed = match value {
                Value::String(s) => buff_time::parse_ts(s).ok(),
                Value::Number(n) => n.as_i64().and_then(|ms| buff_time::from_epoch_ms(ms).ok()),
                _ => None,
            };
            if parsed.is_some() {
                return parsed;
            }
        }
    }
    None
}

fn within_window(
    ts: Option<DateTime<Utc>>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    match ts {
        None => start.is_none() && end.is_none(),
        Some(ts) => {
            start.map(|s| ts >= s).unwrap_or(true) && end.map(|e| ts <= e).unwrap_or(true)
        }
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

const TRADE_TS_KEYS: [&str; 4] = ["entry_time", "timestamp", "time", "ts"];

/// Windowed, paginated trades from `trades.jsonl`.
pub fn load_trades(
    run_dir: &Path,
    start_ts: Option<DateTime<Utc>>,
    end_ts: Option<DateTime<Utc>>,
    page: Page,
) -> Result<Value, ResolveError> {
    let path = run_dir.join("trades.jsonl");
    if !path.is_file() {
        return Err(ResolveError::new(404, "trades_missing", "trades.jsonl missing"));
    }
    let rows = read_jsonl(&path, "trades_missing", "trades_invalid")?;

    let filtered: Vec<Value> = rows
        .into_iter()
        .filter(|row| within_window(row_ts(row, &TRADE_TS_KEYS), start_ts, end_ts))
        .collect();

    let total = filtered.len() as u64;
    let offset = (page.page.saturating_sub(1) * page.page_size) as usize;
    let results: Vec<Value> = filtered
        .into_iter()
        .skip(offset)
        .take(page.page_size as usize)
        .map(normalize_trade)
        .collect();

    Ok(json!({
        "total": total,
        "page": page.page,
        "page_size": page.page_size,
        "results": results,
        "timestamp_field": "entry_time",
    }))
}

fn normalize_trade(row: Value) -> Value {
    let mut map = match row {
        Value::Object(map) => map,
        other => return other,
    };
    for key in ["entry_time", "exit_time"] {
        if let Some(Value::String(raw)) = map.get(key).cloned() {
            if let Ok(parsed) = buff_time::parse_ts(&raw) {
                map.insert(key.to_string(), json!(buff_time::format_ts(parsed)));
            }
        }
    }
    Value::Object(map)
}

/// Chart markers: one entry and one exit marker per round-trip.
pub fn load_trade_markers(
    run_dir: &Path,
    start_ts: Option<DateTime<Utc>>,
    end_ts: Option<DateTime<Utc>>,
) -> Result<Value, ResolveError> {
    let trades = load_trades(
        run_dir,
        start_ts,
        end_ts,
        Page {
            page: 1,
            page_size: 500,
        },
    )?;

    let mut markers = Vec::new();
    for trade in trades["results"].as_array().into_iter().flatten() {
        markers.push(json!({
            "time": trade.get("entry_time").cloned().unwrap_or(Value::Null),
            "kind": "entry",
            "side": trade.get("side").cloned().unwrap_or(Value::Null),
            "price": trade.get("entry_price").cloned().unwrap_or(Value::Null),
        }));
        markers.push(json!({
            "time": trade.get("exit_time").cloned().unwrap_or(Value::Null),
            "kind": "exit",
            "side": trade.get("side").cloned().unwrap_or(Value::Null),
            "price": trade.get("exit_price").cloned().unwrap_or(Value::Null),
            "pnl": trade.get("pnl").cloned().unwrap_or(Value::Null),
        }));
    }
    Ok(json!({"total": markers.len(), "markers": markers}))
}

// ---------------------------------------------------------------------------
// OHLCV
// ---------------------------------------------------------------------------

/// Windowed, limited candles from an `ohlcv_<tf>.jsonl` artifact.
pub fn load_ohlcv(
    path: &Path,
    start_ts: Option<DateTime<Utc>>,
    end_ts: Option<DateTime<Utc>>,
    limit: Option<u64>,
) -> Result<Value, ResolveError> {
    let rows = read_jsonl(path, "ohlcv_missing", "ohlcv_invalid")?;

    let filtered: Vec<Value> = rows
        .into_iter()
        .filter(|row| within_window(row_ts(row, &["ts", "timestamp"]), start_ts, end_ts))
        .collect();
    let total = filtered.len() as u64;

    let results: Vec<Value> = match limit {
        Some(limit) => filtered.into_iter().take(limit as usize).collect(),
        None => filtered,
    };

    Ok(json!({"total": total, "results": results}))
}

// ---------------------------------------------------------------------------
// Metrics & timeline
// ---------------------------------------------------------------------------

pub fn load_metrics(run_dir: &Path) -> Result<Value, ResolveError> {
    let path = run_dir.join("metrics.json");
    let text = fs::read_to_string(&path)
        .map_err(|_| ResolveError::new(404, "metrics_missing", "metrics.json missing"))?;
    let payload: Value = serde_json::from_str(&text)
        .map_err(|_| ResolveError::new(422, "metrics_invalid", "metrics.json invalid"))?;
    if !payload.is_object() {
        return Err(ResolveError::new(
            422,
            "metrics_invalid",
            "metrics.json must be an object",
        ));
    }
    Ok(payload)
}

/// The timeline artifact with event timestamps normalized.
pub fn load_timeline(run_dir: &Path) -> Result<Vec<Value>, ResolveError> {
    let path = run_dir.join("timeline.json");
    let text = fs::read_to_string(&path)
        .map_err(|_| ResolveError::new(404, "timeline_missing", "timeline artifact missing"))?;
    let payload: Value = serde_json::from_str(&text)
        .map_err(|_| ResolveError::new(422, "timeline_invalid", "timeline artifact invalid"))?;
    let events = payload
        .as_array()
        .ok_or_else(|| ResolveError::new(422, "timeline_invalid", "timeline must be an array"))?;
    Ok(events.iter().cloned().map(normalize_record).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
