//! The uniform error envelope every surface emits.
//!
//! Top level carries `{code, message, details}` plus a nested `error`
//! mirror and the structured `error_envelope` with a human message, a
//! recovery hint, the artifact reference, and the provenance block (always
//! stamped with the stage token).

use serde_json::{json, Map, Value};

/// Echoed in every error envelope and observability provenance block.
pub const STAGE_TOKEN: &str = "S5_EXECUTION_SAFETY_BOUNDARIES";

/// Artifact implicated by an error code, when the code names one.
fn artifact_for_code(code: &str) -> Option<&'static str> {
    match code {
        "decision_records_missing" | "decision_records_invalid" => Some("decision_records.jsonl"),
        "metrics_missing" | "metrics_invalid" => Some("metrics.json"),
        "ohlcv_missing" | "ohlcv_invalid" => Some("ohlcv artifact"),
        "timeline_missing" | "timeline_invalid" => Some("timeline artifact"),
        "trades_missing" | "trades_invalid" => Some("trades artifact"),
        "ARTIFACT_NOT_FOUND" => Some("artifact"),
        _ => None,
    }
}

/// Short human-actionable hint per terminal code; part of the external
/// contract.
pub fn recovery_hint(code: &str) -> &'static str {
    match code {
        "RUNS_ROOT_UNSET" => "Set RUNS_ROOT to a writable local path and restart the API.",
        "RUNS_ROOT_MISSING" => {
            "Create RUNS_ROOT (or point to an existing folder) and restart the API."
        }
        "RUNS_ROOT_INVALID" => "Point RUNS_ROOT to a directory path and restart the API.",
        "RUNS_ROOT_NOT_WRITABLE" => "Fix RUNS_ROOT permissions, then retry.",
        "RUN_NOT_FOUND" => "Verify the run_id and ensure it exists under RUNS_ROOT.",
        "RUN_CORRUPTED" => "Recreate the run to regenerate missing artifacts.",
        "RUN_CONFIG_INVALID" => "Fix the run request payload and retry.",
        "RUN_EXISTS" => "Pick a new run_id or repost the identical request.",
        "RUN_ID_INVALID" => "Use a valid run id with letters, numbers, underscores, or hyphens.",
        "STRATEGY_INVALID" => "Use a supported strategy id with valid params.",
        "RISK_INVALID" => "Use a risk level between 1 and 5.",
        "DATA_INVALID" => "Fix CSV schema/timestamps and rerun.",
        "DATA_SOURCE_NOT_FOUND" => "Point data_source.path at an existing repo-relative CSV.",
        "USER_MISSING" => "Send the X-Buff-User header or configure BUFF_DEFAULT_USER.",
        "USER_INVALID" => "Use a user id of letters, numbers, dots, underscores, or hyphens.",
        "AUTH_MISSING" | "AUTH_INVALID" => "Sign the request with the configured HMAC secret.",
        "TIMESTAMP_MISSING" | "TIMESTAMP_INVALID" => {
            "Send X-Buff-Timestamp as current unix seconds."
        }
        "EXPERIMENT_CONFIG_INVALID" => "Fix the experiment request payload and retry.",
        "EXPERIMENT_EXISTS" => "Change the candidate set or read the existing experiment.",
        "EXPERIMENT_CANDIDATES_LIMIT_EXCEEDED" => {
            "Reduce candidates to the allowed maximum and retry."
        }
        "EXPERIMENT_LOCK_TIMEOUT" => "Retry after the experiment lock is released.",
        "REGISTRY_LOCK_TIMEOUT" => "Retry after the registry lock is released.",
        "REGISTRY_WRITE_FAILED" => "Inspect registry/index.json and retry.",
        "KILL_SWITCH_ENABLED" => "Unset the kill switch to re-enable run creation.",
        _ => {
            if artifact_for_code(code).is_some() {
                "Restore or regenerate the referenced artifact, then retry."
            } else {
                "Check API logs and artifacts, then retry."
            }
        }
    }
}

fn as_object(details: Option<&Value>) -> Map<String, Value> {
    details
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn provenance(details: &Map<String, Value>) -> Value {
    let str_or_null = |key: &str| {
        details
            .get(key)
            .and_then(Value::as_str)
            .map(|s| json!(s))
            .unwrap_or(Value::Null)
    };
    json!({
        "run_id": str_or_null("run_id"),
        "strategy": {
            "id": str_or_null("strategy_id"),
            "version": str_or_null("strategy_version"),
            "hash": str_or_null("strategy_hash"),
        },
        "risk_level": details
            .get("risk_level")
            .and_then(Value::as_i64)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "stage_token": details
            .get("stage_token")
            .and_then(Value::as_str)
            .unwrap_or(STAGE_TOKEN),
    })
}

/// The structured `error_envelope` block.
pub fn build_error_envelope(code: &str, message: &str, details: Option<&Value>) -> Value {
    let normalized = as_object(details);

    let artifact_reference = normalized
        .get("artifact_reference")
        .or_else(|| normalized.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| artifact_for_code(code).map(str::to_string));

    let human_message = normalized
        .get("human_message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(message);

    json!({
        "error_code": code,
        "human_message": human_message,
        "recovery_hint": recovery_hint(code),
        "artifact_reference": artifact_reference,
        "provenance": provenance(&normalized),
    })
}

/// The full error body: flat fields + `error` mirror + `error_envelope`.
pub fn build_error_payload(code: &str, message: &str, details: Option<&Value>) -> Value {
    let normalized = Value::Object(as_object(details));
    let envelope = build_error_envelope(code, message, Some(&normalized));
    json!({
        "code": code,
        "message": message,
        "details": normalized.clone(),
        "error": {
            "code": code,
            "message": message,
            "details": normalized,
            "envelope": envelope.clone(),
        },
        "error_envelope": envelope,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
