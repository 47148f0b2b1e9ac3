//! Scenario: the full run lifecycle over HTTP.
//!
//! POST creates (201), the identical repost acknowledges (200), and every
//! read surface serves the artifacts: manifest, metrics, decisions with
//! pagination, summary, OHLCV, timeline, and the hardened CSV export.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use buff_api::{routes, state::AppState};
use buff_testkit::{hold_strategy, run_payload, sample_csv, Sandbox};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

const USER: &str = "flow-user";

fn app_state(sandbox: &Sandbox) -> Arc<AppState> {
    Arc::new(AppState::with_roots(
        Some(sandbox.runs_root().to_path_buf()),
        sandbox.repo_root().to_path_buf(),
    ))
}

async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value) {
    let resp = routes::build_router(Arc::clone(state))
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.expect("collect").to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("X-Buff-User", USER)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("X-Buff-User", USER)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn create_then_read_everything() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let state = app_state(&sandbox);
    let payload = run_payload(&path, hold_strategy());

    let (status, body) = call(&state, post_json("/api/v1/runs", &payload)).await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let run_id = body["run_id"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["links"]["self"], format!("/api/v1/runs/{run_id}"));

    // Idempotent replay.
    let (status, body2) = call(&state, post_json("/api/v1/runs", &payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body2["run_id"], run_id.as_str());

    // Legacy prefix serves identically.
    let (status, _) = call(&state, get(&format!("/api/runs/{run_id}/manifest"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, manifest) = call(&state, get(&format!("/api/v1/runs/{run_id}/manifest"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(manifest["run_id"], run_id.as_str());
    assert_eq!(manifest["execution_mode"], "SIM_ONLY");

    let (status, metrics) = call(&state, get(&format!("/api/v1/runs/{run_id}/metrics"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["num_trades"], 1);
    assert_eq!(metrics["strategy_id"], "hold");

    let (status, decisions) = call(
        &state,
        get(&format!(
            "/api/v1/runs/{run_id}/decisions?page=1&page_size=2"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decisions["total"], 5);
    assert_eq!(decisions["results"].as_array().unwrap().len(), 2);

    let (status, filtered) = call(
        &state,
        get(&format!(
            "/api/v1/runs/{run_id}/decisions?action=ENTER_LONG,EXIT_LONG"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(filtered["total"], 2);

    let (status, summary) = call(&state, get(&format!("/api/v1/runs/{run_id}/summary"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["run_id"], run_id.as_str());
    assert_eq!(summary["counts_by_action"]["HOLD"], 3);
    assert_eq!(summary["malformed_lines_count"], 0);
    assert!(summary["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a == "metrics.json"));

    let (status, candles) = call(&state, get(&format!("/api/v1/runs/{run_id}/ohlcv"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(candles["total"], 5);
    assert_eq!(candles["source"], "ohlcv_1m.jsonl");

    let (status, timeline) = call(&state, get(&format!("/api/v1/runs/{run_id}/timeline"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(timeline["total"], 4); // CREATED/VALIDATED/RUNNING/COMPLETED

    let (status, trades) = call(&state, get(&format!("/api/v1/runs/{run_id}/trades"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trades["total"], 1);

    let (status, raw) = call(
        &state,
        get(&format!(
            "/api/v1/runs/{run_id}/artifacts/decision_records.jsonl"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // JSONL comes back as a text payload with one record per line.
    assert_eq!(raw.as_str().unwrap().lines().count(), 5);
}

#[tokio::test]
async fn csv_export_has_attachment_headers() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let state = app_state(&sandbox);

    let (_, body) = call(&state, post_json("/api/v1/runs", &run_payload(&path, hold_strategy()))).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(get(&format!(
            "/api/v1/runs/{run_id}/decisions/export?format=csv"
        )))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers().clone();
    assert_eq!(headers["cache-control"], "no-store");
    let disposition = headers["content-disposition"].to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains(&format!("{run_id}-decisions.csv")));
    assert!(headers["content-type"].to_str().unwrap().starts_with("text/csv"));

    let text = String::from_utf8(
        resp.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    let header_line = text.lines().next().unwrap();
    assert!(header_line.contains("action"));
    assert_eq!(text.lines().count(), 6); // header + 5 records
}

#[tokio::test]
async fn invalid_export_format_and_bad_paging_rejected() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let state = app_state(&sandbox);
    let (_, body) = call(&state, post_json("/api/v1/runs", &run_payload(&path, hold_strategy()))).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, err) = call(
        &state,
        get(&format!(
            "/api/v1/runs/{run_id}/decisions/export?format=parquet"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "invalid_export_format");

    let (status, err) = call(
        &state,
        get(&format!("/api/v1/runs/{run_id}/decisions?page_size=900")),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["code"], "validation_error");

    let (status, err) = call(
        &state,
        get(&format!(
            "/api/v1/runs/{run_id}/decisions?start_ts=not-a-time"
        )),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "invalid_timestamp");
}

#[tokio::test]
async fn path_traversal_request_is_rejected() {
    let sandbox = Sandbox::new();
    sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let state = app_state(&sandbox);

    let payload = run_payload("fixtures/../../../etc/passwd", hold_strategy());
    let (status, err) = call(&state, post_json("/api/v1/runs", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "RUN_CONFIG_INVALID");
    assert_eq!(err["error"]["code"], "RUN_CONFIG_INVALID");
    assert_eq!(
        err["error_envelope"]["provenance"]["stage_token"],
        "S5_EXECUTION_SAFETY_BOUNDARIES"
    );
}

#[tokio::test]
async fn malformed_json_body_is_run_config_invalid() {
    let sandbox = Sandbox::new();
    let state = app_state(&sandbox);
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/runs")
        .header("X-Buff-User", USER)
        .body(Body::from("{ not json"))
        .unwrap();
    let (status, err) = call(&state, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "RUN_CONFIG_INVALID");
}

#[tokio::test]
async fn experiment_endpoints_roundtrip() {
    let sandbox = Sandbox::new();
    let path = sandbox.write_fixture("fixtures/sample.csv", &sample_csv());
    let state = app_state(&sandbox);

    let payload = json!({
        "schema_version": "1.0.0",
        "candidates": [
            {"candidate_id": "only_one", "run_config": run_payload(&path, hold_strategy())},
        ],
    });
    let (status, body) = call(&state, post_json("/api/v1/experiments", &payload)).await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let experiment_id = body["experiment_id"].as_str().unwrap().to_string();

    let (status, manifest) = call(
        &state,
        get(&format!("/api/v1/experiments/{experiment_id}/manifest")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(manifest["status"], "COMPLETED");

    let (status, comparison) = call(
        &state,
        get(&format!("/api/v1/experiments/{experiment_id}/comparison")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(comparison["rows"].as_array().unwrap().len(), 1);

    let (status, listing) = call(&state, get("/api/v1/experiments")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["total"], 1);

    let (status, absent) = call(&state, get("/api/v1/experiments/exp_nope00000000/manifest")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(absent["code"], "ARTIFACT_NOT_FOUND");
}
