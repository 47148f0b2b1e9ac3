//! The run pipeline: normalize → idempotency gate → load/validate CSV →
//! simulate → stage artifacts in a temp dir → atomic rename → register.
//!
//! Failure atomicity: the run directory appears only via the final rename,
//! every failure before it removes the temp directory, and a run that fails
//! to register is removed again so the registry never lies.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use buff_canon::CanonError;
use buff_data::Bar;
use buff_engine::{run_engine, EngineConfig, EngineError, EngineResult, Strategy};
use buff_registry::RegistryLock;
use buff_schemas::{
    ConfigPayload, Manifest, ManifestArtifacts, ManifestData, ManifestRisk, ManifestStrategy,
    MetricsPayload, OhlcvRow, TimelineEvent, CAPABILITIES, EXECUTION_MODE_SIM_ONLY,
};

use crate::request::{normalize_request, NormalizedRequest};
use crate::{RunError, BUILDER_VERSION, ENGINE_VERSION};

/// Fixed starting equity of every simulation.
pub const INITIAL_EQUITY: f64 = 10_000.0;

const STATUS_HISTORY: [&str; 4] = ["CREATED", "VALIDATED", "RUNNING", "COMPLETED"];

/// Everything the builder needs from the environment, resolved up front so
/// the pipeline itself never consults env vars.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Validated, writable artifacts root.
    pub runs_root: PathBuf,
    /// Root that repo-relative CSV paths resolve against.
    pub repo_root: PathBuf,
}

/// HTTP-ready outcome: 201 on fresh creation, 200 on idempotent replay.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status_code: u16,
    pub body: Value,
}

// ---------------------------------------------------------------------------
// Runs root resolution
// ---------------------------------------------------------------------------

/// Validate the configured artifacts root: set, existing, a directory, and
/// writable (probe file created and removed).
pub fn resolve_runs_root(configured: Option<&Path>) -> Result<PathBuf, RunError> {
    let root = configured.ok_or_else(|| {
        RunError::new("RUNS_ROOT_UNSET", 503, "RUNS_ROOT is not set")
            .with_details(json!({"env": buff_paths::RUNS_ROOT_ENV}))
    })?;

    if !root.exists() {
        return Err(
            RunError::new("RUNS_ROOT_MISSING", 503, "RUNS_ROOT does not exist")
                .with_details(json!({"path": root.display().to_string()})),
        );
    }
    if !root.is_dir() {
        return Err(
            RunError::new("RUNS_ROOT_INVALID", 503, "RUNS_ROOT is not a directory")
                .with_details(json!({"path": root.display().to_string()})),
        );
    }
    if let Err(message) = check_writable(root) {
        return Err(
            RunError::new("RUNS_ROOT_NOT_WRITABLE", 503, "RUNS_ROOT is not writable")
                .with_details(json!({"path": root.display().to_string(), "error": message})),
        );
    }
    Ok(root.to_path_buf())
}

/// Probe write: create and delete a marker file.
pub fn check_writable(root: &Path) -> Result<(), String> {
    let probe = root.join(format!(".buff_write_check_{}", std::process::id()));
    fs::write(&probe, b"ok").map_err(|e| e.to_string())?;
    fs::remove_file(&probe).map_err(|e| e.to_string())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// create_run
// ---------------------------------------------------------------------------

/// Build (or idempotently re-acknowledge) one run for `owner_user_id`.
pub fn create_run(
    ctx: &BuildContext,
    payload: &Value,
    owner_user_id: &str,
) -> Result<RunOutcome, RunError> {
    let owner = owner_user_id.trim();
    if !buff_paths::is_valid_user_id(owner) {
        return Err(RunError::new("USER_INVALID", 400, "Invalid user id")
            .with_details(json!({"user_id": owner_user_id})));
    }

    let (normalized, source_path, meta) = normalize_request(payload, &ctx.repo_root)?;
    let inputs_hash = buff_canon::sha256_hex(
        &buff_canon::to_canonical_bytes(&normalized)
            .map_err(|e| RunError::new("RUN_CONFIG_INVALID", 400, e.to_string()))?,
    );

    let run_id = match payload.get("run_id") {
        Some(Value::Null) | None => format!("run_{}", &inputs_hash[..12]),
        Some(value) => {
            let requested = value.as_str().unwrap_or("").trim().to_string();
            if !buff_paths::is_valid_run_id(&requested) {
                return Err(RunError::new("RUN_ID_INVALID", 400, "run_id is invalid")
                    .with_details(json!({"run_id": value})));
            }
            requested
        }
    };

    let user_root = buff_paths::user_root(&ctx.runs_root, owner);
    let runs_root = buff_paths::user_runs_root(&ctx.runs_root, owner);
    fs::create_dir_all(&runs_root)
        .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

    let run_dir = buff_paths::resolve_run_dir(&ctx.runs_root, owner, &run_id).ok_or_else(|| {
        RunError::new("RUN_ID_INVALID", 400, "run_id resolved outside runs root")
    })?;

    // Idempotency gate: an existing directory with the same inputs hash is
    // this very run; anything else is a conflict.
    if run_dir.exists() {
        let manifest = read_manifest_value(&run_dir);
        let existing_hash = manifest
            .as_ref()
            .and_then(|m| m.get("inputs_hash"))
            .and_then(Value::as_str);
        if let (Some(manifest), Some(existing)) = (&manifest, existing_hash) {
            if existing == inputs_hash {
                register_run(&user_root, &run_dir, manifest)?;
                let status = manifest
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("COMPLETED");
                return Ok(RunOutcome {
                    status_code: 200,
                    body: success_body(&run_id, status, &inputs_hash),
                });
            }
        }
        return Err(RunError::new("RUN_EXISTS", 409, "run_id already exists")
            .with_details(json!({"run_id": run_id})));
    }

    // Load + validate, then align the execution timeframe.
    let (start, end) = normalized.parsed_window();
    let (bars_1m, data_meta) = buff_data::load_and_validate_1m(
        &source_path,
        &normalized.data_source.path,
        start,
        end,
    )
    .map_err(|e| RunError::new("DATA_INVALID", 400, e.to_string()))?;

    let minutes = buff_data::timeframe_minutes(&normalized.data_source.timeframe)
        .map_err(|e| RunError::new("RUN_CONFIG_INVALID", 400, e.to_string()))?;
    let bars_tf = buff_data::resample(&bars_1m, minutes)
        .map_err(|e| RunError::new("DATA_INVALID", 400, e.to_string()))?;

    let created_at = buff_time::format_ts(bars_1m[0].ts);

    let engine_config = engine_config_from(&normalized)?;
    let mut result = run_engine(&bars_tf, &engine_config).map_err(|e| match e {
        EngineError::EmptyData => RunError::new("RUN_CONFIG_INVALID", 400, e.to_string()),
        EngineError::InvalidParams(_) => RunError::new("STRATEGY_INVALID", 400, e.to_string()),
    })?;
    for decision in &mut result.decisions {
        decision.run_id = Some(run_id.clone());
    }

    let inputs_value = serde_json::to_value(&normalized)
        .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

    let config_payload = ConfigPayload {
        schema_version: normalized.schema_version.clone(),
        run_id: run_id.clone(),
        engine_version: ENGINE_VERSION.to_string(),
        builder_version: BUILDER_VERSION.to_string(),
        inputs: inputs_value.clone(),
    };
    let metrics_payload = build_metrics_payload(&result, &engine_config);
    let manifest = build_manifest(
        &run_id,
        owner,
        &created_at,
        &normalized,
        inputs_value,
        &inputs_hash,
        &data_meta,
        meta,
    );

    // Stage everything in a temp sibling, then one rename makes it visible.
    let temp_dir = runs_root.join(format!(
        ".tmp_{}_{}",
        run_id,
        &Uuid::new_v4().simple().to_string()[..8]
    ));
    let write_result = write_artifacts(
        &temp_dir,
        &manifest,
        &config_payload,
        &metrics_payload,
        &result,
        &bars_1m,
        &bars_tf,
        &normalized.data_source.timeframe,
    )
    .and_then(|_| {
        fs::rename(&temp_dir, &run_dir).map_err(|e| {
            RunError::new("RUN_WRITE_FAILED", 500, e.to_string())
        })?;
        buff_canon::fsync_dir(&runs_root);
        Ok(())
    });
    if let Err(err) = write_result {
        let _ = fs::remove_dir_all(&temp_dir);
        return Err(err);
    }

    // Registry upsert under lock; a run we cannot register is removed.
    let manifest_value = serde_json::to_value(&manifest)
        .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;
    if let Err(err) = register_run(&user_root, &run_dir, &manifest_value) {
        let _ = fs::remove_dir_all(&run_dir);
        return Err(err);
    }

    info!(run_id = %run_id, user = %owner, "run created");
    Ok(RunOutcome {
        status_code: 201,
        body: success_body(&run_id, "COMPLETED", &inputs_hash),
    })
}

fn engine_config_from(normalized: &NormalizedRequest) -> Result<EngineConfig, RunError> {
    let params = &normalized.strategy.params;
    let strategy = match normalized.strategy.id.as_str() {
        "hold" => Strategy::Hold,
        "ma_cross" => Strategy::MaCross {
            fast: params.get("fast_period").and_then(Value::as_u64).unwrap_or(10) as usize,
            slow: params.get("slow_period").and_then(Value::as_u64).unwrap_or(20) as usize,
        },
        "demo_threshold" => Strategy::DemoThreshold {
            threshold: params.get("threshold").and_then(Value::as_f64).unwrap_or(0.0),
        },
        _ => {
            return Err(RunError::new("STRATEGY_INVALID", 400, "strategy.id is invalid"));
        }
    };
    Ok(EngineConfig {
        strategy,
        symbol: normalized.data_source.symbol.clone(),
        timeframe: normalized.data_source.timeframe.clone(),
        risk_level: normalized.risk.level,
        commission_bps: normalized.costs.commission_bps,
        slippage_bps: normalized.costs.slippage_bps,
        initial_equity: INITIAL_EQUITY,
    })
}

fn build_metrics_payload(result: &EngineResult, config: &EngineConfig) -> MetricsPayload {
    MetricsPayload {
        total_return: result.metrics.total_return,
        max_drawdown: result.metrics.max_drawdown,
        num_records: result.metrics.num_records,
        win_rate: result.metrics.win_rate,
        initial_equity: result.metrics.initial_equity,
        final_equity: result.metrics.final_equity,
        num_trades: result.trades.len() as u64,
        symbol: config.symbol.clone(),
        timeframe: config.timeframe.clone(),
        strategy_id: config.strategy.id().to_string(),
        costs: buff_schemas::CostsSpec {
            commission_bps: config.commission_bps,
            slippage_bps: config.slippage_bps,
        },
        risk_level: config.risk_level,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_manifest(
    run_id: &str,
    owner_user_id: &str,
    created_at: &str,
    normalized: &NormalizedRequest,
    inputs_value: Value,
    inputs_hash: &str,
    data_meta: &buff_data::DataMeta,
    meta: Value,
) -> Manifest {
    let timeframe = &normalized.data_source.timeframe;
    let mut meta_map = match meta {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    meta_map.insert(
        "owner_user_id".to_string(),
        Value::String(owner_user_id.to_string()),
    );

    Manifest {
        schema_version: normalized.schema_version.clone(),
        run_id: run_id.to_string(),
        created_at: created_at.to_string(),
        engine_version: ENGINE_VERSION.to_string(),
        builder_version: BUILDER_VERSION.to_string(),
        status: "COMPLETED".to_string(),
        status_history: STATUS_HISTORY.iter().map(|s| s.to_string()).collect(),
        inputs: inputs_value,
        inputs_hash: inputs_hash.to_string(),
        data: ManifestData {
            source_type: "csv".to_string(),
            source_path: data_meta.source_path.clone(),
            symbol: normalized.data_source.symbol.clone(),
            timeframe: timeframe.clone(),
            start_ts: normalized.data_source.start_ts.clone(),
            end_ts: normalized.data_source.end_ts.clone(),
            canonical_timeframe: "1m".to_string(),
            data_start_ts: data_meta.data_start_ts.clone(),
            data_end_ts: data_meta.data_end_ts.clone(),
        },
        strategy: ManifestStrategy {
            id: normalized.strategy.id.clone(),
            params: normalized.strategy.params.clone(),
        },
        risk: ManifestRisk {
            level: normalized.risk.level,
        },
        artifacts: ManifestArtifacts {
            decision_records: "decision_records.jsonl".to_string(),
            metrics: "metrics.json".to_string(),
            timeline: "timeline.json".to_string(),
            additional: vec![
                "config.json".to_string(),
                "equity_curve.json".to_string(),
                "trades.jsonl".to_string(),
                "ohlcv_1m.jsonl".to_string(),
                format!("ohlcv_{timeframe}.jsonl"),
            ],
        },
        execution_mode: EXECUTION_MODE_SIM_ONLY.to_string(),
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        meta: Value::Object(meta_map),
    }
}

/// Timeline: one event per status transition, stamped at `created_at`.
pub fn build_timeline(created_at: &str, statuses: &[String]) -> Vec<TimelineEvent> {
    statuses
        .iter()
        .enumerate()
        .map(|(idx, status)| TimelineEvent {
            timestamp: created_at.to_string(),
            event_type: "run".to_string(),
            title: status.clone(),
            detail: format!("status={status}"),
            severity: "INFO".to_string(),
            stage: status.clone(),
            duration_ms: 0,
            seq: idx as u64,
        })
        .collect()
}

fn ohlcv_rows(bars: &[Bar]) -> Vec<OhlcvRow> {
    bars.iter()
        .map(|bar| OhlcvRow {
            ts: buff_time::format_ts(bar.ts),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn write_artifacts(
    dir: &Path,
    manifest: &Manifest,
    config_payload: &ConfigPayload,
    metrics_payload: &MetricsPayload,
    result: &EngineResult,
    bars_1m: &[Bar],
    bars_tf: &[Bar],
    timeframe: &str,
) -> Result<(), RunError> {
    let canon = |err: CanonError| match err {
        CanonError::NonFiniteNumber => {
            RunError::new("DATA_INVALID", 400, "Non-finite numeric value")
        }
        other => RunError::new("RUN_WRITE_FAILED", 500, other.to_string()),
    };

    fs::create_dir_all(dir).map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

    buff_canon::write_canonical_json(&dir.join("manifest.json"), manifest).map_err(canon)?;
    buff_canon::write_canonical_json(&dir.join("config.json"), config_payload).map_err(canon)?;
    buff_canon::write_canonical_json(&dir.join("metrics.json"), metrics_payload).map_err(canon)?;
    buff_canon::write_canonical_json(&dir.join("equity_curve.json"), &result.equity_curve)
        .map_err(canon)?;
    buff_canon::write_canonical_json(
        &dir.join("timeline.json"),
        &build_timeline(&manifest.created_at, &manifest.status_history),
    )
    .map_err(canon)?;
    buff_canon::write_canonical_jsonl(&dir.join("decision_records.jsonl"), &result.decisions)
        .map_err(canon)?;
    buff_canon::write_canonical_jsonl(&dir.join("trades.jsonl"), &result.trades).map_err(canon)?;
    buff_canon::write_canonical_jsonl(&dir.join("ohlcv_1m.jsonl"), &ohlcv_rows(bars_1m))
        .map_err(canon)?;
    buff_canon::write_canonical_jsonl(
        &dir.join(format!("ohlcv_{timeframe}.jsonl")),
        &ohlcv_rows(bars_tf),
    )
    .map_err(canon)?;
    Ok(())
}

fn read_manifest_value(run_dir: &Path) -> Option<Value> {
    let text = fs::read_to_string(run_dir.join("manifest.json")).ok()?;
    serde_json::from_str(&text).ok()
}

fn register_run(user_root: &Path, run_dir: &Path, manifest: &Value) -> Result<(), RunError> {
    let lock = RegistryLock::acquire(user_root).map_err(registry_error)?;
    lock.upsert_entry(run_dir, manifest)
        .map(|_| ())
        .map_err(registry_error)
}

fn registry_error(err: buff_registry::RegistryError) -> RunError {
    match err {
        buff_registry::RegistryError::LockTimeout => {
            RunError::new("REGISTRY_LOCK_TIMEOUT", 503, "Registry lock timeout")
        }
        other => RunError::new("REGISTRY_WRITE_FAILED", 500, other.to_string()),
    }
}

fn success_body(run_id: &str, status: &str, inputs_hash: &str) -> Value {
    json!({
        "run_id": run_id,
        "status": status,
        "inputs_hash": inputs_hash,
        "message": "run ready",
        "links": {
            "self": format!("/api/v1/runs/{run_id}"),
            "ui": format!("/runs/{run_id}"),
        },
    })
}
