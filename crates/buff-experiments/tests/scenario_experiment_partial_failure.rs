//! Scenario: experiment partial-failure semantics.
//!
//! Two candidates, one valid `hold` and one with an unknown strategy id:
//! the experiment still writes a complete manifest + comparison, reports
//! PARTIAL with `succeeded=1 / failed=1`, the comparison has exactly one
//! row (the succeeded candidate, values copied from its metrics.json), and
//! the failed candidate carries a structured error with no traceback text.

use std::fs;

use buff_experiments::create_experiment;
use buff_runs::BuildContext;
use buff_testkit::{hold_strategy, run_payload, sample_csv, Sandbox};
use serde_json::{json, Value};

const USER: &str = "test-user";

fn ctx(sandbox: &Sandbox) -> BuildContext {
    BuildContext {
        runs_root: sandbox.runs_root().to_path_buf(),
        repo_root: sandbox.repo_root().to_path_buf(),
    }
}

fn experiment_payload(path: &str) -> Value {
    json!({
        "schema_version": "1.0.0",
        "name": "partial-failure",
        "candidates": [
            {"candidate_id": "good_hold", "run_config": run_payload(path, hold_strategy())},
            {
                "candidate_id": "bad_strategy",
                "run_config": run_payload(path, json!({"id": "unknown_strategy"})),
            },
        ],
    })
}

fn read_artifact(sandbox: &Sandbox, experiment_id: &str, name: &str) -> Value {
    let path = sandbox
        .runs_root()
        .join("users")
        .join(USER)
        .join("experiments")
        .join(experiment_id)
        .join(name);
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn partial_failure_writes_complete_artifacts() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let payload = experiment_payload(&path);

    let outcome = create_experiment(&ctx(&sandbox), &payload, USER).unwrap();
    assert_eq!(outcome.status_code, 201);
    assert_eq!(outcome.body["status"], "PARTIAL");
    assert_eq!(outcome.body["counts"]["total_candidates"], 2);
    assert_eq!(outcome.body["counts"]["succeeded"], 1);
    assert_eq!(outcome.body["counts"]["failed"], 1);
    let experiment_id = outcome.body["experiment_id"].as_str().unwrap().to_string();
    assert!(experiment_id.starts_with("exp_"));

    let manifest = read_artifact(&sandbox, &experiment_id, "experiment_manifest.json");
    assert_eq!(manifest["status"], "PARTIAL");
    assert_eq!(
        manifest["status_history"],
        json!(["CREATED", "RUNNING", "PARTIAL"])
    );
    assert_eq!(manifest["execution_mode"], "SIM_ONLY");
    assert_eq!(manifest["summary"]["succeeded"], 1);
    assert_eq!(manifest["meta"]["owner_user_id"], USER);

    let candidates = manifest["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 2);
    let good = &candidates[0];
    assert_eq!(good["candidate_id"], "good_hold");
    assert_eq!(good["status"], "COMPLETED");
    assert!(good["run_id"].as_str().unwrap().starts_with("run_"));

    let bad = &candidates[1];
    assert_eq!(bad["status"], "FAILED");
    assert_eq!(bad["run_id"], Value::Null);
    let error_code = bad["error"]["code"].as_str().unwrap();
    assert!(
        error_code == "STRATEGY_INVALID" || error_code == "RUN_CONFIG_INVALID",
        "unexpected code {error_code}"
    );
    let serialized = serde_json::to_string(&manifest).unwrap();
    assert!(!serialized.contains("Traceback"));
    assert!(!serialized.contains("panicked"));

    // Comparison: one row, values verbatim from the run's metrics.json.
    let comparison = read_artifact(&sandbox, &experiment_id, "comparison_summary.json");
    assert_eq!(comparison["status"], "PARTIAL");
    let rows = comparison["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["candidate_id"], "good_hold");
    assert_eq!(row["strategy_id"], "hold");

    let run_id = row["run_id"].as_str().unwrap();
    let metrics: Value = serde_json::from_str(
        &fs::read_to_string(sandbox.user_run_dir(USER, run_id).join("metrics.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(row["total_return"], metrics["total_return"]);
    assert_eq!(row["final_equity"], metrics["final_equity"]);
    assert_eq!(row["num_trades"], metrics["num_trades"]);

    let columns: Vec<&str> = comparison["columns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap())
        .collect();
    assert_eq!(
        columns,
        vec![
            "candidate_index",
            "candidate_id",
            "run_id",
            "status",
            "strategy_id",
            "symbol",
            "timeframe",
            "risk_level",
            "total_return",
            "final_equity",
            "max_drawdown",
            "win_rate",
            "num_trades",
        ]
    );
}

#[test]
fn replaying_the_same_experiment_returns_200() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let payload = experiment_payload(&path);
    let ctx = ctx(&sandbox);

    let first = create_experiment(&ctx, &payload, USER).unwrap();
    assert_eq!(first.status_code, 201);

    let second = create_experiment(&ctx, &payload, USER).unwrap();
    assert_eq!(second.status_code, 200);
    assert_eq!(second.body["experiment_id"], first.body["experiment_id"]);
    assert_eq!(second.body["status"], "PARTIAL");
    assert_eq!(second.body["counts"], first.body["counts"]);
}

#[test]
fn all_candidates_failing_is_failed_status() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let payload = json!({
        "schema_version": "1.0.0",
        "candidates": [
            {"run_config": run_payload(&path, json!({"id": "nope"}))},
        ],
    });

    let outcome = create_experiment(&ctx(&sandbox), &payload, USER).unwrap();
    assert_eq!(outcome.status_code, 201);
    assert_eq!(outcome.body["status"], "FAILED");

    let experiment_id = outcome.body["experiment_id"].as_str().unwrap().to_string();
    let comparison = read_artifact(&sandbox, &experiment_id, "comparison_summary.json");
    assert!(comparison["rows"].as_array().unwrap().is_empty());
}
