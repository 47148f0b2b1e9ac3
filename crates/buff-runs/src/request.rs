//! Strict request normalization.
//!
//! The normalized request is the hashing domain: `None` fields are omitted
//! from serialization, timestamps are canonical UTC-Z strings, strategy
//! params are reduced to their typed defaults, and the CSV path is the
//! repo-relative normalized form. Canonical bytes of this struct are the
//! run's `inputs_hash`.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use buff_schemas::CostsSpec;

use crate::RunError;

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedDataSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub path: String,
    pub symbol: String,
    pub timeframe: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedStrategy {
    pub id: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRisk {
    pub level: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedRequest {
    pub schema_version: String,
    pub data_source: NormalizedDataSource,
    pub strategy: NormalizedStrategy,
    pub risk: NormalizedRisk,
    pub costs: CostsSpec,
    pub seed: i64,
}

impl NormalizedRequest {
    pub fn parsed_window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let parse = |opt: &Option<String>| {
            opt.as_deref().and_then(|raw| buff_time::parse_ts(raw).ok())
        };
        (
            parse(&self.data_source.start_ts),
            parse(&self.data_source.end_ts),
        )
    }
}

fn bad_request(message: &str) -> RunError {
    RunError::new("RUN_CONFIG_INVALID", 400, message)
}

/// Normalize and validate a raw request body.
///
/// Returns the normalized request, the resolved absolute CSV path, and the
/// optional `meta` fields (`name`, `notes`, `created_by`).
pub fn normalize_request(
    payload: &Value,
    repo_root: &Path,
) -> Result<(NormalizedRequest, PathBuf, Value), RunError> {
    let payload = payload
        .as_object()
        .ok_or_else(|| bad_request("Request body must be an object"))?;

    let schema_version = payload
        .get("schema_version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("schema_version is required"))?
        .to_string();

    let data_source = payload
        .get("data_source")
        .and_then(Value::as_object)
        .ok_or_else(|| bad_request("data_source is required"))?;

    let source_type = data_source
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    if source_type != "csv" {
        return Err(bad_request("data_source.type must be csv"));
    }

    let path_raw = data_source
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("data_source.path is required"))?;

    let (normalized_path, source_path) = resolve_source_path(path_raw, repo_root)?;
    if !source_path.is_file() {
        return Err(
            RunError::new("DATA_SOURCE_NOT_FOUND", 400, "CSV path not found")
                .with_details(json!({"path": path_raw})),
        );
    }

    let symbol = data_source
        .get("symbol")
        .or_else(|| payload.get("symbol"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_ascii_uppercase();
    if symbol.is_empty() || !symbol.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(bad_request("symbol is invalid"));
    }

    let timeframe = data_source
        .get("timeframe")
        .or_else(|| payload.get("timeframe"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if timeframe != "1m" && timeframe != "5m" {
        return Err(bad_request("timeframe must be 1m or 5m"));
    }

    let start_ts = normalize_window_bound(data_source.get("start_ts"))?;
    let end_ts = normalize_window_bound(data_source.get("end_ts"))?;
    if let (Some(start), Some(end)) = (&start_ts, &end_ts) {
        if start >= end {
            return Err(bad_request("start_ts must be < end_ts"));
        }
    }

    let strategy = normalize_strategy(payload.get("strategy"))?;
    let risk_level = normalize_risk(payload.get("risk"))?;
    let costs = normalize_costs(payload.get("costs"))?;

    let seed = payload.get("seed").and_then(Value::as_i64).unwrap_or(0);

    let normalized = NormalizedRequest {
        schema_version,
        data_source: NormalizedDataSource {
            source_type: "csv".to_string(),
            path: normalized_path,
            symbol,
            timeframe,
            start_ts,
            end_ts,
        },
        strategy,
        risk: NormalizedRisk { level: risk_level },
        costs,
        seed,
    };

    let mut meta = Map::new();
    for key in ["name", "notes", "created_by"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                meta.insert(key.to_string(), Value::String(trimmed.to_string()));
            }
        }
    }

    Ok((normalized, source_path, Value::Object(meta)))
}

fn normalize_window_bound(raw: Option<&Value>) -> Result<Option<String>, RunError> {
    let value = match raw {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    let parsed = match value {
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| RunError::new("DATA_INVALID", 400, "timestamp invalid"))?;
            buff_time::from_epoch_ms(ms)
                .map_err(|_| RunError::new("DATA_INVALID", 400, "timestamp invalid"))?
        }
        Value::String(s) => buff_time::parse_ts(s)
            .map_err(|_| RunError::new("DATA_INVALID", 400, "timestamp invalid"))?,
        _ => return Err(RunError::new("DATA_INVALID", 400, "timestamp invalid")),
    };
    Ok(Some(buff_time::format_ts(parsed)))
}

fn normalize_strategy(raw: Option<&Value>) -> Result<NormalizedStrategy, RunError> {
    let strategy = raw
        .and_then(Value::as_object)
        .ok_or_else(|| bad_request("strategy is required"))?;

    let id = strategy
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RunError::new("STRATEGY_INVALID", 400, "strategy.id is required"))?;

    let params = strategy.get("params").cloned().unwrap_or(json!({}));
    let params = params
        .as_object()
        .ok_or_else(|| RunError::new("STRATEGY_INVALID", 400, "strategy.params must be an object"))?
        .clone();

    let invalid = |msg: &str| RunError::new("STRATEGY_INVALID", 400, msg);

    let params = match id {
        "hold" => json!({}),
        "ma_cross" => {
            let fast = int_param(&params, "fast_period", 10)
                .ok_or_else(|| invalid("ma_cross params invalid"))?;
            let slow = int_param(&params, "slow_period", 20)
                .ok_or_else(|| invalid("ma_cross params invalid"))?;
            if fast <= 0 || slow <= 0 || fast >= slow {
                return Err(invalid("ma_cross params invalid"));
            }
            json!({"fast_period": fast, "slow_period": slow})
        }
        "demo_threshold" => {
            let threshold = float_param(&params, "threshold", 0.0)
                .ok_or_else(|| invalid("demo_threshold params invalid"))?;
            if !(0.0..=10.0).contains(&threshold) {
                return Err(invalid("demo_threshold params invalid"));
            }
            json!({"threshold": threshold})
        }
        _ => return Err(invalid("strategy.id is invalid")),
    };

    Ok(NormalizedStrategy {
        id: id.to_string(),
        params,
    })
}

fn int_param(params: &Map<String, Value>, key: &str, default: i64) -> Option<i64> {
    match params.get(key) {
        None | Some(Value::Null) => Some(default),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float_param(params: &Map<String, Value>, key: &str, default: f64) -> Option<f64> {
    match params.get(key) {
        None | Some(Value::Null) => Some(default),
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn normalize_risk(raw: Option<&Value>) -> Result<i64, RunError> {
    let risk = raw
        .and_then(Value::as_object)
        .ok_or_else(|| RunError::new("RISK_INVALID", 400, "risk is required"))?;
    let level = risk
        .get("level")
        .and_then(Value::as_i64)
        .ok_or_else(|| RunError::new("RISK_INVALID", 400, "risk.level must be an integer"))?;
    if !(1..=5).contains(&level) {
        return Err(RunError::new("RISK_INVALID", 400, "risk.level must be 1..5"));
    }
    Ok(level)
}

fn normalize_costs(raw: Option<&Value>) -> Result<CostsSpec, RunError> {
    let costs = raw
        .and_then(Value::as_object)
        .ok_or_else(|| bad_request("costs is required"))?;
    if !costs.contains_key("commission_bps") || !costs.contains_key("slippage_bps") {
        return Err(bad_request("costs fields are required"));
    }

    let numeric = |key: &str| -> Result<f64, RunError> {
        match costs.get(key) {
            Some(Value::Number(n)) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .ok_or_else(|| bad_request("costs values must be numeric")),
            _ => Err(bad_request("costs values must be numeric")),
        }
    };
    let commission_bps = numeric("commission_bps")?;
    let slippage_bps = numeric("slippage_bps")?;
    if commission_bps < 0.0 || slippage_bps < 0.0 {
        return Err(bad_request("costs values must be >= 0"));
    }

    Ok(CostsSpec {
        commission_bps,
        slippage_bps,
    })
}

// ---------------------------------------------------------------------------
// Source-path resolution
// ---------------------------------------------------------------------------

/// Resolve a repo-relative CSV path with traversal and symlink hardening.
///
/// Absolute paths, `~`, drive prefixes, and `..` segments are rejected up
/// front; when the target exists, the canonicalized form must still live
/// under the canonicalized repo root so a symlink cannot escape it.
fn resolve_source_path(path_raw: &str, repo_root: &Path) -> Result<(String, PathBuf), RunError> {
    if is_absolute_like(path_raw) {
        return Err(bad_request("data_source.path must be relative"));
    }

    let normalized = normalize_rel_path(path_raw);
    let rel = Path::new(&normalized);
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(bad_request("data_source.path must not contain '..'"));
    }

    let joined = repo_root.join(rel);
    if !buff_paths::is_within_root(&joined, repo_root) {
        return Err(bad_request("data_source.path must be within repo"));
    }

    if joined.exists() {
        let canonical_root = repo_root
            .canonicalize()
            .map_err(|_| bad_request("data_source.path must be within repo"))?;
        let canonical = joined
            .canonicalize()
            .map_err(|_| bad_request("data_source.path must be within repo"))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(bad_request("data_source.path must not resolve outside repo"));
        }
    }

    Ok((normalized, joined))
}

fn is_absolute_like(value: &str) -> bool {
    if value.starts_with('~') {
        return true;
    }
    let path = Path::new(value);
    if path.is_absolute() || value.starts_with('/') || value.starts_with('\\') {
        return true;
    }
    // Windows drive prefix ("C:...").
    let bytes = value.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn normalize_rel_path(value: &str) -> String {
    let forward = value.replace('\\', "/");
    forward
        .strip_prefix("./")
        .unwrap_or(&forward)
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
