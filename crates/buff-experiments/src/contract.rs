//! Experiment request contract: schema pinning, candidate normalization,
//! and the candidate-count cap.

use serde::Serialize;
use serde_json::{json, Value};

use buff_runs::RunError;

pub const EXPERIMENT_SCHEMA_VERSION: &str = "1.0.0";
pub const MAX_EXPERIMENT_CANDIDATES: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedCandidate {
    pub candidate_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub run_config: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizedExperiment {
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub candidates: Vec<NormalizedCandidate>,
}

fn invalid(message: &str) -> RunError {
    RunError::new("EXPERIMENT_CONFIG_INVALID", 400, message)
}

/// Validate and normalize an experiment request body.
pub fn normalize_experiment_request(payload: &Value) -> Result<NormalizedExperiment, RunError> {
    let payload = payload
        .as_object()
        .ok_or_else(|| invalid("Request body must be an object"))?;

    let schema_version = payload
        .get("schema_version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("schema_version is required"))?;
    if schema_version != EXPERIMENT_SCHEMA_VERSION {
        return Err(invalid("schema_version is invalid")
            .with_details(json!({"schema_version": schema_version})));
    }

    let raw_candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| invalid("candidates must be a non-empty array"))?;
    if raw_candidates.len() > MAX_EXPERIMENT_CANDIDATES {
        return Err(RunError::new(
            "EXPERIMENT_CANDIDATES_LIMIT_EXCEEDED",
            400,
            "too many candidates",
        )
        .with_details(json!({
            "requested_count": raw_candidates.len(),
            "max_allowed": MAX_EXPERIMENT_CANDIDATES,
        })));
    }

    let mut candidates = Vec::with_capacity(raw_candidates.len());
    for (index, raw) in raw_candidates.iter().enumerate() {
        candidates.push(normalize_candidate(raw, index)?);
    }

    let text_field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(NormalizedExperiment {
        schema_version: schema_version.to_string(),
        name: text_field("name"),
        notes: text_field("notes"),
        candidates,
    })
}

fn normalize_candidate(raw: &Value, index: usize) -> Result<NormalizedCandidate, RunError> {
    let candidate = raw.as_object().ok_or_else(|| {
        invalid("candidate must be an object").with_details(json!({"candidate_index": index}))
    })?;

    let candidate_id = match candidate.get("candidate_id") {
        None | Some(Value::Null) => format!("cand_{:03}", index + 1),
        Some(value) => {
            let id = value.as_str().unwrap_or("").trim().to_ascii_lowercase();
            if !buff_paths::is_valid_candidate_id(&id) {
                return Err(invalid("candidate_id is invalid").with_details(json!({
                    "candidate_index": index,
                    "candidate_id": value,
                })));
            }
            id
        }
    };

    // A candidate either wraps its run request in `run_config` or *is* one.
    let run_config = match candidate.get("run_config") {
        Some(config) => config.clone(),
        None => raw.clone(),
    };
    if !run_config.is_object() {
        return Err(invalid("candidate.run_config must be an object")
            .with_details(json!({"candidate_index": index})));
    }

    let label = candidate
        .get("label")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(NormalizedCandidate {
        candidate_id,
        label,
        run_config,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_with(candidates: Value) -> Value {
        json!({"schema_version": "1.0.0", "candidates": candidates})
    }

    #[test]
    fn candidate_ids_default_by_index() {
        let payload = payload_with(json!([
            {"run_config": {"strategy": {"id": "hold"}}},
            {"run_config": {"strategy": {"id": "hold"}}},
        ]));
        let normalized = normalize_experiment_request(&payload).unwrap();
        assert_eq!(normalized.candidates[0].candidate_id, "cand_001");
        assert_eq!(normalized.candidates[1].candidate_id, "cand_002");
    }

    #[test]
    fn explicit_candidate_id_is_lowercased_and_validated() {
        let payload = payload_with(json!([
            {"candidate_id": "Fast_Sweep", "run_config": {}},
        ]));
        let normalized = normalize_experiment_request(&payload).unwrap();
        assert_eq!(normalized.candidates[0].candidate_id, "fast_sweep");

        let bad = payload_with(json!([{"candidate_id": "x", "run_config": {}}]));
        let err = normalize_experiment_request(&bad).unwrap_err();
        assert_eq!(err.code, "EXPERIMENT_CONFIG_INVALID");
    }

    #[test]
    fn wrong_schema_version_rejected() {
        let payload = json!({"schema_version": "2.0.0", "candidates": [{"run_config": {}}]});
        let err = normalize_experiment_request(&payload).unwrap_err();
        assert_eq!(err.code, "EXPERIMENT_CONFIG_INVALID");
    }

    #[test]
    fn empty_candidates_rejected() {
        let err = normalize_experiment_request(&payload_with(json!([]))).unwrap_err();
        assert_eq!(err.code, "EXPERIMENT_CONFIG_INVALID");
    }

    #[test]
    fn candidate_cap_enforced_with_counts() {
        let many: Vec<Value> = (0..=MAX_EXPERIMENT_CANDIDATES)
            .map(|_| json!({"run_config": {}}))
            .collect();
        let err = normalize_experiment_request(&payload_with(json!(many))).unwrap_err();
        assert_eq!(err.code, "EXPERIMENT_CANDIDATES_LIMIT_EXCEEDED");
        assert_eq!(
            err.details["requested_count"].as_u64().unwrap() as usize,
            MAX_EXPERIMENT_CANDIDATES + 1
        );
        assert_eq!(
            err.details["max_allowed"].as_u64().unwrap() as usize,
            MAX_EXPERIMENT_CANDIDATES
        );
    }

    #[test]
    fn bare_candidate_doubles_as_run_config() {
        let payload = payload_with(json!([
            {"schema_version": "1.0.0", "strategy": {"id": "hold"}},
        ]));
        let normalized = normalize_experiment_request(&payload).unwrap();
        assert_eq!(
            normalized.candidates[0].run_config["strategy"]["id"],
            "hold"
        );
    }

    #[test]
    fn name_and_notes_trimmed_into_normalized_form() {
        let mut payload = payload_with(json!([{"run_config": {}}]));
        payload["name"] = json!("  sweep  ");
        payload["notes"] = json!("");
        let normalized = normalize_experiment_request(&payload).unwrap();
        assert_eq!(normalized.name.as_deref(), Some("sweep"));
        assert!(normalized.notes.is_none());

        let v = serde_json::to_value(&normalized).unwrap();
        assert!(v.get("notes").is_none());
    }
}
