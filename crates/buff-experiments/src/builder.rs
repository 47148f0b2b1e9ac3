//! Experiment builder: lock, idempotency on the digest, candidate loop,
//! and atomic emission of the manifest + comparison summary.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde_json::{json, Value};
use tracing::info;

use buff_runs::{check_writable, create_run, BuildContext, RunError};
use buff_schemas::{
    CandidateResult, ComparisonRow, ComparisonSummary, ExperimentArtifacts, ExperimentCounts,
    ExperimentManifest, CAPABILITIES, COMPARISON_COLUMNS, EXECUTION_MODE_SIM_ONLY,
};

use crate::contract::{normalize_experiment_request, NormalizedExperiment};

/// Experiment lock is short-lived relative to the registry lock.
const LOCK_TIMEOUT: Duration = Duration::from_millis(250);
const LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub status_code: u16,
    pub body: Value,
}

// ---------------------------------------------------------------------------
// Experiment lock
// ---------------------------------------------------------------------------

struct ExperimentLock {
    file: fs::File,
}

impl ExperimentLock {
    fn acquire(experiments_root: &Path, experiment_id: &str) -> Result<Self, RunError> {
        let lock_path = experiments_root.join(format!(".{experiment_id}.lock"));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if start.elapsed() >= LOCK_TIMEOUT => {
                    return Err(RunError::new(
                        "EXPERIMENT_LOCK_TIMEOUT",
                        503,
                        "Experiment lock timeout",
                    ))
                }
                Err(_) => std::thread::sleep(LOCK_POLL),
            }
        }
    }
}

impl Drop for ExperimentLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// create_experiment
// ---------------------------------------------------------------------------

/// Create (or idempotently re-acknowledge) an experiment for one user.
pub fn create_experiment(
    ctx: &BuildContext,
    payload: &Value,
    owner_user_id: &str,
) -> Result<ExperimentOutcome, RunError> {
    let owner = owner_user_id.trim();
    if !buff_paths::is_valid_user_id(owner) {
        return Err(RunError::new("USER_INVALID", 400, "Invalid user id")
            .with_details(json!({"user_id": owner_user_id})));
    }

    let runs_root = buff_paths::user_runs_root(&ctx.runs_root, owner);
    let experiments_root = buff_paths::user_experiments_root(&ctx.runs_root, owner);
    for dir in [&runs_root, &experiments_root] {
        fs::create_dir_all(dir).map_err(|e| {
            RunError::new("RUNS_ROOT_NOT_WRITABLE", 503, "RUNS_ROOT is not writable")
                .with_details(json!({
                    "path": ctx.runs_root.display().to_string(),
                    "error": e.to_string(),
                }))
        })?;
    }
    if let Err(message) = check_writable(&runs_root) {
        return Err(
            RunError::new("RUNS_ROOT_NOT_WRITABLE", 503, "RUNS_ROOT is not writable")
                .with_details(json!({
                    "path": ctx.runs_root.display().to_string(),
                    "error": message,
                })),
        );
    }

    let normalized = normalize_experiment_request(payload)?;
    let digest = buff_canon::sha256_hex(
        &buff_canon::to_canonical_bytes(&normalized)
            .map_err(|e| RunError::new("EXPERIMENT_CONFIG_INVALID", 400, e.to_string()))?,
    );
    let experiment_id = format!("exp_{}", &digest[..12]);

    let experiment_dir = experiments_root.join(&experiment_id);
    if !buff_paths::is_within_root(&experiment_dir, &experiments_root) {
        return Err(RunError::new(
            "EXPERIMENT_CONFIG_INVALID",
            400,
            "experiment_id resolved outside experiments root",
        )
        .with_details(json!({"experiment_id": experiment_id})));
    }

    // Everything from the idempotency read to the final rename happens under
    // the per-experiment lock; concurrent creators either win, observe the
    // finished manifest (200), or time out (503).
    let _lock = ExperimentLock::acquire(&experiments_root, &experiment_id)?;

    if let Some(existing) = load_existing_manifest(&experiment_dir) {
        let existing_digest = existing
            .get("experiment_digest")
            .and_then(Value::as_str)
            .unwrap_or("");
        if existing_digest == digest {
            return Ok(ExperimentOutcome {
                status_code: 200,
                body: replay_body(&experiment_id, &digest, &existing, &normalized),
            });
        }
        return Err(
            RunError::new("EXPERIMENT_EXISTS", 409, "experiment_id already exists")
                .with_details(json!({"experiment_id": experiment_id})),
        );
    }

    // Candidate loop: failures are recorded, never propagated.
    let mut candidate_results: Vec<CandidateResult> = Vec::new();
    let mut comparison_rows: Vec<ComparisonRow> = Vec::new();
    for (index, candidate) in normalized.candidates.iter().enumerate() {
        let mut result = CandidateResult {
            candidate_index: index as u64,
            candidate_id: candidate.candidate_id.clone(),
            status: "FAILED".to_string(),
            run_id: None,
            label: candidate.label.clone(),
            run_status: None,
            run_status_code: None,
            inputs_hash: None,
            error: None,
        };

        match run_candidate(ctx, owner, &runs_root, candidate.run_config.clone(), index) {
            Ok((status_code, run_id, run_status, inputs_hash, metrics)) => {
                comparison_rows.push(build_comparison_row(
                    index as u64,
                    &candidate.candidate_id,
                    &run_id,
                    &run_status,
                    &metrics,
                ));
                result.status = "COMPLETED".to_string();
                result.run_id = Some(run_id);
                result.run_status = Some(run_status);
                result.run_status_code = Some(status_code);
                result.inputs_hash = inputs_hash;
            }
            Err(err) => {
                result.error = Some(err.to_payload());
            }
        }
        candidate_results.push(result);
    }

    let succeeded = candidate_results
        .iter()
        .filter(|c| c.status == "COMPLETED")
        .count() as u64;
    let failed = candidate_results.len() as u64 - succeeded;
    let overall_status = if failed == 0 {
        "COMPLETED"
    } else if succeeded == 0 {
        "FAILED"
    } else {
        "PARTIAL"
    };

    let inputs_value = serde_json::to_value(&normalized)
        .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;
    let counts = ExperimentCounts {
        total_candidates: candidate_results.len() as u64,
        succeeded,
        failed,
    };

    let manifest = ExperimentManifest {
        schema_version: normalized.schema_version.clone(),
        experiment_id: experiment_id.clone(),
        experiment_digest: digest.clone(),
        status: overall_status.to_string(),
        status_history: vec![
            "CREATED".to_string(),
            "RUNNING".to_string(),
            overall_status.to_string(),
        ],
        execution_mode: EXECUTION_MODE_SIM_ONLY.to_string(),
        capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        inputs: inputs_value,
        candidates: candidate_results,
        summary: counts.clone(),
        artifacts: ExperimentArtifacts {
            manifest: "experiment_manifest.json".to_string(),
            comparison: "comparison_summary.json".to_string(),
        },
        meta: json!({"owner_user_id": owner}),
    };
    let comparison = ComparisonSummary {
        schema_version: "1.0.0".to_string(),
        experiment_id: experiment_id.clone(),
        experiment_digest: digest.clone(),
        status: overall_status.to_string(),
        counts: counts.clone(),
        columns: COMPARISON_COLUMNS.iter().map(|c| c.to_string()).collect(),
        rows: comparison_rows,
    };

    write_experiment_artifacts(&experiments_root, &experiment_dir, &manifest, &comparison)?;

    info!(experiment_id = %experiment_id, user = %owner, status = %overall_status,
          "experiment created");
    Ok(ExperimentOutcome {
        status_code: 201,
        body: success_body(&experiment_id, &digest, overall_status, &counts),
    })
}

type CandidateRun = (u16, String, String, Option<String>, Value);

fn run_candidate(
    ctx: &BuildContext,
    owner: &str,
    runs_root: &Path,
    run_config: Value,
    index: usize,
) -> Result<CandidateRun, RunError> {
    let outcome = create_run(ctx, &run_config, owner)?;
    let run_id = outcome.body["run_id"]
        .as_str()
        .unwrap_or("")
        .trim()
        .to_string();
    if run_id.is_empty() {
        return Err(RunError::new(
            "RUN_WRITE_FAILED",
            500,
            "Run creation returned empty run_id",
        )
        .with_details(json!({"candidate_index": index})));
    }
    let run_status = outcome.body["status"]
        .as_str()
        .unwrap_or("COMPLETED")
        .to_string();
    let inputs_hash = outcome.body["inputs_hash"].as_str().map(str::to_string);
    let metrics = load_run_metrics(runs_root, &run_id)?;
    Ok((outcome.status_code, run_id, run_status, inputs_hash, metrics))
}

fn load_run_metrics(runs_root: &Path, run_id: &str) -> Result<Value, RunError> {
    let run_dir = runs_root.join(run_id);
    if !buff_paths::is_within_root(&run_dir, runs_root) {
        return Err(
            RunError::new("RUN_ID_INVALID", 400, "run_id resolved outside runs root")
                .with_details(json!({"run_id": run_id})),
        );
    }
    let metrics_path = run_dir.join("metrics.json");
    if !metrics_path.is_file() {
        return Err(RunError::new("METRICS_MISSING", 500, "metrics.json missing")
            .with_details(json!({"run_id": run_id})));
    }
    let text = fs::read_to_string(&metrics_path)
        .map_err(|_| RunError::new("METRICS_INVALID", 500, "metrics.json invalid"))?;
    let payload: Value = serde_json::from_str(&text)
        .map_err(|_| RunError::new("METRICS_INVALID", 500, "metrics.json invalid"))?;
    if !payload.is_object() {
        return Err(
            RunError::new("METRICS_INVALID", 500, "metrics.json must be an object")
                .with_details(json!({"run_id": run_id})),
        );
    }
    Ok(payload)
}

/// Scalars copied straight from `metrics.json`; absent or mistyped fields
/// surface as nulls rather than being recomputed.
fn build_comparison_row(
    candidate_index: u64,
    candidate_id: &str,
    run_id: &str,
    run_status: &str,
    metrics: &Value,
) -> ComparisonRow {
    let as_str = |key: &str| {
        metrics
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let as_f64 = |key: &str| metrics.get(key).and_then(Value::as_f64);
    let as_i64 = |key: &str| metrics.get(key).and_then(Value::as_i64);

    ComparisonRow {
        candidate_index,
        candidate_id: candidate_id.to_string(),
        run_id: run_id.to_string(),
        status: run_status.to_string(),
        strategy_id: as_str("strategy_id"),
        symbol: as_str("symbol"),
        timeframe: as_str("timeframe"),
        risk_level: as_i64("risk_level"),
        total_return: as_f64("total_return"),
        final_equity: as_f64("final_equity"),
        max_drawdown: as_f64("max_drawdown"),
        win_rate: as_f64("win_rate"),
        num_trades: as_i64("num_trades"),
    }
}

fn write_experiment_artifacts(
    experiments_root: &Path,
    experiment_dir: &Path,
    manifest: &ExperimentManifest,
    comparison: &ComparisonSummary,
) -> Result<(), RunError> {
    let temp_dir = experiments_root.join(format!(
        ".tmp_{}",
        experiment_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    let _ = fs::remove_dir_all(&temp_dir);
    fs::create_dir_all(&temp_dir)
        .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

    let write = || -> Result<(), RunError> {
        buff_canon::write_canonical_json(&temp_dir.join("experiment_manifest.json"), manifest)
            .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;
        buff_canon::write_canonical_json(&temp_dir.join("comparison_summary.json"), comparison)
            .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;
        fs::rename(&temp_dir, experiment_dir)
            .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;
        buff_canon::fsync_dir(experiments_root);
        Ok(())
    };
    if let Err(err) = write() {
        let _ = fs::remove_dir_all(&temp_dir);
        return Err(err);
    }
    Ok(())
}

fn load_existing_manifest(experiment_dir: &Path) -> Option<Value> {
    let path = experiment_dir.join("experiment_manifest.json");
    let text = fs::read_to_string(path).ok()?;
    let payload: Value = serde_json::from_str(&text).ok()?;
    payload.is_object().then_some(payload)
}

fn normalize_status(value: Option<&Value>) -> String {
    let text = value
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_ascii_uppercase();
    if text.is_empty() {
        "FAILED".to_string()
    } else {
        text
    }
}

fn replay_body(
    experiment_id: &str,
    digest: &str,
    existing: &Value,
    normalized: &NormalizedExperiment,
) -> Value {
    let count_status = |status: &str| {
        existing
            .get("candidates")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.get("status").and_then(Value::as_str) == Some(status))
                    .count() as u64
            })
            .unwrap_or(0)
    };
    let counts = ExperimentCounts {
        total_candidates: normalized.candidates.len() as u64,
        succeeded: count_status("COMPLETED"),
        failed: count_status("FAILED"),
    };
    success_body(
        experiment_id,
        digest,
        &normalize_status(existing.get("status")),
        &counts,
    )
}

fn success_body(experiment_id: &str, digest: &str, status: &str, counts: &ExperimentCounts) -> Value {
    json!({
        "experiment_id": experiment_id,
        "experiment_digest": digest,
        "status": status,
        "counts": {
            "total_candidates": counts.total_candidates,
            "succeeded": counts.succeeded,
            "failed": counts.failed,
        },
        "links": {
            "manifest": format!("/api/v1/experiments/{experiment_id}/manifest"),
            "comparison": format!("/api/v1/experiments/{experiment_id}/comparison"),
        },
    })
}

// ---------------------------------------------------------------------------
// Experiment listing (read-model)
// ---------------------------------------------------------------------------

/// Project every experiment directory into `{experiment_id, status, counts}`.
pub fn list_experiments(runs_root: &Path, user_id: &str) -> Vec<Value> {
    let experiments_root = buff_paths::user_experiments_root(runs_root, user_id);
    let mut out: Vec<(String, Value)> = Vec::new();
    let entries = match fs::read_dir(&experiments_root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        let manifest = match load_existing_manifest(&entry.path()) {
            Some(m) => m,
            None => continue,
        };
        let projection = json!({
            "experiment_id": manifest.get("experiment_id").cloned().unwrap_or(json!(name.clone())),
            "experiment_digest": manifest.get("experiment_digest").cloned().unwrap_or(Value::Null),
            "status": manifest.get("status").cloned().unwrap_or(Value::Null),
            "counts": manifest.get("summary").cloned().unwrap_or(Value::Null),
        });
        out.push((name, projection));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out.into_iter().map(|(_, v)| v).collect()
}
