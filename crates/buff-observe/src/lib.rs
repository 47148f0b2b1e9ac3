//! Read-only observability projections over the registry and artifacts.
//!
//! Nothing here mutates the runs root: registries are read lock-free
//! (tolerating concurrent writers via the atomic-rename discipline) and
//! artifact state is probed by stat only. Degraded states surface the
//! structured envelope with the stage token rather than raw errors.

use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use buff_registry::{load_registry, scan_artifacts};
use buff_runs::{check_writable, resolve_runs_root, RunError};
use buff_schemas::{build_error_envelope, REQUIRED_ARTIFACTS, STAGE_TOKEN};

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Readiness probe: runs-root reachability/writability, registry load, and
/// legacy run integrity.
///
/// A missing/invalid runs root is a canonical 503 error; anything softer
/// degrades `status` to `not_ready` in a 200 payload.
pub fn readiness(
    configured_root: Option<&Path>,
    default_user: Option<&str>,
) -> Result<Value, RunError> {
    let runs_root = resolve_runs_root(configured_root)?;

    let mut checks: Vec<Value> = Vec::new();

    let writable = check_writable(&runs_root).is_ok();
    checks.push(json!({
        "name": "runs_root",
        "ok": writable,
        "status": if writable { "ok" } else { "not_writable" },
        "path": runs_root.display().to_string(),
        "writable": writable,
    }));

    let registry_ok = match default_user {
        Some(user) if buff_paths::is_valid_user_id(user) => {
            // A tolerant load never fails; the check proves the file is
            // readable where it exists.
            let user_root = buff_paths::user_root(&runs_root, user);
            let _ = load_registry(&user_root);
            true
        }
        _ => true,
    };
    checks.push(json!({
        "name": "registry_access",
        "ok": registry_ok,
        "status": if registry_ok { "ok" } else { "error" },
    }));

    let (integrity_ok, integrity_detail) = run_integrity(&runs_root, default_user);
    checks.push(json!({
        "name": "run_integrity",
        "ok": integrity_ok,
        "status": if integrity_ok { "ok" } else { "degraded" },
        "detail": integrity_detail,
    }));

    let ready = checks.iter().all(|c| c["ok"] == true);
    Ok(json!({
        "status": if ready { "ready" } else { "not_ready" },
        "api_version": "1",
        "stage_token": STAGE_TOKEN,
        "checks": checks,
    }))
}

/// Legacy integrity: no unmigrated top-level runs, and (when a default user
/// is configured) all of that user's registered runs intact on disk.
fn run_integrity(runs_root: &Path, default_user: Option<&str>) -> (bool, Value) {
    let user = match default_user {
        Some(user) if buff_paths::is_valid_user_id(user) => user,
        _ => return (true, Value::Null),
    };

    let mut legacy: Vec<String> = Vec::new();
    if let Ok(entries) = fs::read_dir(runs_root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "users" || name.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() && entry.path().join("manifest.json").is_file() {
                legacy.push(name);
            }
        }
    }
    legacy.sort();
    if !legacy.is_empty() {
        return (false, json!({"unmigrated_runs": legacy}));
    }

    let user_root = buff_paths::user_root(runs_root, user);
    let runs_dir = user_root.join("runs");
    let mut corrupted: Vec<String> = Vec::new();
    for entry in load_registry(&user_root).runs {
        let run_dir = runs_dir.join(&entry.run_id);
        let (missing, _) = scan_artifacts(&run_dir);
        if !run_dir.is_dir() || !missing.is_empty() {
            corrupted.push(entry.run_id);
        }
    }
    if corrupted.is_empty() {
        (true, Value::Null)
    } else {
        (false, json!({"corrupted_runs": corrupted}))
    }
}

// ---------------------------------------------------------------------------
// Run list / detail projections
// ---------------------------------------------------------------------------

/// `GET /observability/runs` projection for one user.
pub fn observability_runs(runs_root: &Path, user_id: &str) -> Value {
    let user_root = buff_paths::user_root(runs_root, user_id);
    let runs_dir = user_root.join("runs");

    let runs: Vec<Value> = load_registry(&user_root)
        .runs
        .into_iter()
        .map(|entry| {
            let (missing, _) = scan_artifacts(&runs_dir.join(&entry.run_id));
            let intact = missing.is_empty();
            json!({
                "run_id": entry.run_id,
                "state": entry.status,
                "created_at": entry.created_at,
                "symbol": entry.symbol,
                "timeframe": entry.timeframe,
                "strategy_id": entry.strategy_id,
                "risk_level": Value::Null,
                "artifact_status": if intact { "OK" } else { "CORRUPTED" },
                "validation_status": if intact { "pass" } else { "fail" },
            })
        })
        .collect();

    json!({
        "stage_token": STAGE_TOKEN,
        "total": runs.len(),
        "runs": runs,
    })
}

/// `GET /observability/runs/{run_id}` projection: manifest provenance plus
/// a per-file integrity report; degraded runs additionally carry the error
/// envelope.
pub fn observability_run_detail(
    runs_root: &Path,
    user_id: &str,
    run_id: &str,
) -> Result<Value, RunError> {
    let run_dir = buff_paths::resolve_run_dir(runs_root, user_id, run_id).ok_or_else(|| {
        RunError::new("RUN_NOT_FOUND", 404, "Run not found")
            .with_details(json!({"run_id": run_id}))
    })?;
    if !run_dir.is_dir() {
        return Err(RunError::new("RUN_NOT_FOUND", 404, "Run not found")
            .with_details(json!({"run_id": run_id})));
    }

    let manifest: Option<Value> = fs::read_to_string(run_dir.join("manifest.json"))
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok());

    let (missing, _) = scan_artifacts(&run_dir);
    let files: Vec<Value> = REQUIRED_ARTIFACTS
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "ok": !missing.contains(&name.to_string()),
            })
        })
        .collect();

    let strategy_id = manifest
        .as_ref()
        .and_then(|m| m.get("strategy"))
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let risk_level = manifest
        .as_ref()
        .and_then(|m| m.get("risk"))
        .and_then(|r| r.get("level"))
        .and_then(Value::as_i64);

    let intact = missing.is_empty();
    let mut detail = json!({
        "run_id": run_id,
        "stage_token": STAGE_TOKEN,
        "provenance": {
            "run_id": run_id,
            "strategy": {
                "id": strategy_id,
                "version": Value::Null,
                "hash": Value::Null,
            },
            "risk_level": risk_level,
            "stage_token": STAGE_TOKEN,
        },
        "manifest": manifest,
        "validation": {
            "status": if intact { "pass" } else { "fail" },
            "missing_artifacts": missing.clone(),
        },
        "artifact_integrity": {
            "ok": intact,
            "files": files,
        },
    });

    if !intact {
        let envelope = build_error_envelope(
            "RUN_CORRUPTED",
            "Run artifacts missing",
            Some(&json!({
                "run_id": run_id,
                "artifact_reference": missing.first(),
            })),
        );
        detail["error_envelope"] = envelope;
    }

    Ok(detail)
}

/// `GET /observability/registry` projection. The plugin validator is an
/// external producer; without its index the plugin fields report unknown.
pub fn observability_registry(runs_root: &Path, user_id: &str) -> Value {
    let user_root = buff_paths::user_root(runs_root, user_id);
    let index_path = user_root.join(buff_paths::REGISTRY_FILENAME);

    let integrity_status = if !index_path.exists() {
        "absent"
    } else {
        match fs::read_to_string(&index_path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        {
            Some(v) if v.is_object() => "ok",
            _ => "corrupted",
        }
    };

    json!({
        "stage_token": STAGE_TOKEN,
        "registry_integrity_status": integrity_status,
        "total_runs": load_registry(&user_root).runs.len(),
        "plugin_load_status": "unknown",
        "failed_plugins": [],
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
