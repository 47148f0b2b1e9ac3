//! Axum router and all HTTP handlers.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so the
//! scenario tests in `tests/` can compose the router directly.
//!
//! Both `/api` (legacy) and `/api/v1` serve the same routes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use buff_artifacts::{
    build_summary, build_timeline_from_decisions, collect_error_records, collect_run_artifacts,
    export_media_type, filter_decisions, load_metrics, load_ohlcv, load_timeline,
    load_trade_markers, load_trades, resolve_ohlcv_path, resolve_run_dir,
    stream_export, validate_decision_records, DecisionFilter, ExportFormat, Page,
};
use buff_registry::RegistryLock;
use buff_runs::{create_run, migrate_legacy_runs, resolve_runs_root, BuildContext};
use buff_schemas::{Registry, RegistryEntry};

use crate::errors::ApiError;
use crate::state::AppState;

type Params = Vec<(String, String)>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .nest("/api/v1", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/health/ready", get(ready))
        .route("/runs", get(list_runs).post(create_run_endpoint))
        .route("/runs/:run_id/manifest", get(run_manifest))
        .route("/runs/:run_id/artifacts/:name", get(run_artifact))
        .route("/runs/:run_id/summary", get(run_summary))
        .route("/runs/:run_id/decisions", get(decisions))
        .route("/runs/:run_id/decisions/export", get(decisions_export))
        .route("/runs/:run_id/trades", get(trades))
        .route("/runs/:run_id/trades/markers", get(trade_markers))
        .route("/runs/:run_id/trades/export", get(trades_export))
        .route("/runs/:run_id/ohlcv", get(ohlcv))
        .route("/runs/:run_id/metrics", get(metrics))
        .route("/runs/:run_id/timeline", get(timeline))
        .route("/runs/:run_id/errors", get(run_errors))
        .route("/runs/:run_id/errors/export", get(errors_export))
        .route(
            "/experiments",
            get(list_experiments_endpoint).post(create_experiment_endpoint),
        )
        .route("/experiments/:experiment_id/manifest", get(experiment_manifest))
        .route(
            "/experiments/:experiment_id/comparison",
            get(experiment_comparison),
        )
        .route("/observability/runs", get(observe_runs))
        .route("/observability/runs/:run_id", get(observe_run_detail))
        .route("/observability/registry", get(observe_registry))
        .route("/admin/migrate", post(admin_migrate))
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Resolve the requesting user (header / default / HMAC) for this request.
fn request_user(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    uri: &OriginalUri,
) -> Result<String, ApiError> {
    let lookup = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let ctx = buff_auth::resolve_user_context(
        &lookup,
        method.as_str(),
        uri.0.path(),
        &state.auth,
        now_unix(),
    )?;
    Ok(ctx.user_id)
}

fn valid_runs_root(state: &AppState) -> Result<PathBuf, ApiError> {
    Ok(resolve_runs_root(state.runs_root.as_deref())?)
}

fn build_ctx(state: &AppState) -> Result<BuildContext, ApiError> {
    Ok(BuildContext {
        runs_root: valid_runs_root(state)?,
        repo_root: state.repo_root.clone(),
    })
}

/// Reconcile-and-read the user's registry under the advisory lock.
fn reconciled_registry(user_root: &std::path::Path) -> Result<Registry, ApiError> {
    let lock = RegistryLock::acquire(user_root).map_err(|e| match e {
        buff_registry::RegistryError::LockTimeout => {
            ApiError::new(503, "REGISTRY_LOCK_TIMEOUT", "Registry lock timeout")
        }
        other => ApiError::new(500, "REGISTRY_WRITE_FAILED", other.to_string()),
    })?;
    lock.reconcile()
        .map_err(|e| ApiError::new(500, "REGISTRY_WRITE_FAILED", e.to_string()))
}

/// Registry-gated run resolution for manifest/raw-artifact reads: the entry
/// must exist for this user and must not be CORRUPTED.
fn gate_registered_run(
    state: &AppState,
    user: &str,
    run_id: &str,
) -> Result<(PathBuf, RegistryEntry), ApiError> {
    let runs_root = valid_runs_root(state)?;
    if !buff_paths::is_valid_run_id(run_id) {
        return Err(ApiError::new(400, "RUN_CONFIG_INVALID", "Invalid run_id")
            .with_details(json!({"run_id": run_id})));
    }

    let user_root = buff_paths::user_root(&runs_root, user);
    let registry = reconciled_registry(&user_root)?;
    let entry = registry
        .runs
        .into_iter()
        .find(|entry| entry.run_id == run_id)
        .ok_or_else(|| {
            ApiError::new(404, "RUN_NOT_FOUND", "Run not found")
                .with_details(json!({"run_id": run_id}))
        })?;
    if entry.status == "CORRUPTED" {
        return Err(ApiError::new(409, "RUN_CORRUPTED", "Run artifacts missing")
            .with_details(json!({"run_id": run_id})));
    }

    let run_dir = resolve_run_dir(&runs_root, user, run_id)?;
    Ok((run_dir, entry))
}

/// Plain directory resolution for typed artifact readers.
fn run_dir_of(state: &AppState, user: &str, run_id: &str) -> Result<PathBuf, ApiError> {
    let runs_root = valid_runs_root(state)?;
    Ok(resolve_run_dir(&runs_root, user, run_id)?)
}

fn kill_switch_gate(state: &AppState) -> Result<(), ApiError> {
    if state.kill_switch {
        return Err(ApiError::new(
            503,
            "KILL_SWITCH_ENABLED",
            "New run creation is disabled by the kill switch",
        ));
    }
    Ok(())
}

fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|_| ApiError::new(400, "RUN_CONFIG_INVALID", "Invalid JSON payload"))
}

/// Repeated and comma-separated filter values, capped at 50 per name.
fn multi_values(params: &Params, name: &str) -> Result<Option<Vec<String>>, ApiError> {
    let mut values: Vec<String> = Vec::new();
    for (key, raw) in params {
        if key != name {
            continue;
        }
        for item in raw.split(',') {
            let item = item.trim();
            if !item.is_empty() {
                values.push(item.to_string());
            }
        }
    }
    if values.len() > 50 {
        return Err(ApiError::new(
            400,
            "too_many_filter_values",
            format!("{name} supports at most 50 values"),
        )
        .with_details(json!({"name": name, "count": values.len()})));
    }
    Ok((!values.is_empty()).then_some(values))
}

fn single_value(params: &Params, name: &str) -> Option<String> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_time_range(
    params: &Params,
) -> Result<
    (
        Option<chrono::DateTime<chrono::Utc>>,
        Option<chrono::DateTime<chrono::Utc>>,
    ),
    ApiError,
> {
    let parse = |name: &str| -> Result<Option<chrono::DateTime<chrono::Utc>>, ApiError> {
        match single_value(params, name) {
            None => Ok(None),
            Some(raw) => buff_time::parse_ts(&raw).map(Some).map_err(|e| {
                ApiError::new(400, "invalid_timestamp", format!("Invalid {name}: {e}"))
                    .with_details(json!({"param": name, "value": raw}))
            }),
        }
    };
    let start = parse("start_ts")?;
    let end = parse("end_ts")?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(ApiError::new(
                400,
                "invalid_time_range",
                "start_ts must be <= end_ts",
            ));
        }
    }
    Ok((start, end))
}

fn parse_page(params: &Params) -> Result<Page, ApiError> {
    let parse_u64 = |name: &str, default: u64| -> Result<u64, ApiError> {
        match single_value(params, name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                ApiError::new(422, "validation_error", "Request validation failed")
                    .with_details(json!({"param": name, "value": raw}))
            }),
        }
    };
    let page = parse_u64("page", 1)?;
    let page_size = parse_u64("page_size", 50)?;
    if page < 1 || !(1..=500).contains(&page_size) {
        return Err(
            ApiError::new(422, "validation_error", "Request validation failed").with_details(
                json!({"page": page, "page_size": page_size}),
            ),
        );
    }
    Ok(Page { page, page_size })
}

fn decision_filter(params: &Params) -> Result<DecisionFilter, ApiError> {
    let (start_ts, end_ts) = parse_time_range(params)?;
    Ok(DecisionFilter {
        symbols: multi_values(params, "symbol")?,
        actions: multi_values(params, "action")?,
        severities: multi_values(params, "severity")?,
        reason_codes: multi_values(params, "reason_code")?,
        start_ts,
        end_ts,
    })
}

/// Decisions path with the fail-closed malformed-lines gate applied.
fn decisions_path_checked(
    run_dir: &std::path::Path,
    run_id: &str,
) -> Result<PathBuf, ApiError> {
    let path = run_dir.join("decision_records.jsonl");
    if !path.is_file() {
        return Err(ApiError::new(
            404,
            "decision_records_missing",
            "decision_records.jsonl missing",
        )
        .with_details(json!({"run_id": run_id})));
    }
    if let Some(malformed) = validate_decision_records(&path)? {
        return Err(ApiError::new(
            422,
            "decision_records_invalid",
            "decision_records.jsonl contains invalid JSON lines",
        )
        .with_details(json!({
            "run_id": run_id,
            "malformed_lines_count": malformed,
        })));
    }
    Ok(path)
}

fn export_response(
    chunks: Box<dyn Iterator<Item = Vec<u8>> + Send>,
    format: ExportFormat,
    filename: &str,
) -> Response {
    let stream = futures_util::stream::iter(
        chunks.map(|chunk| Ok::<Bytes, std::convert::Infallible>(Bytes::from(chunk))),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, export_media_type(format))
        .header(header::CACHE_CONTROL, "no-store")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ---------------------------------------------------------------------------
// Liveness / readiness
// ---------------------------------------------------------------------------

pub(crate) async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "api_version": "1"}))
}

pub(crate) async fn ready(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let payload = buff_observe::readiness(
        state.runs_root.as_deref(),
        state.auth.default_user.as_deref(),
    )?;
    Ok(Json(payload).into_response())
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let runs_root = valid_runs_root(&state)?;
    let user_root = buff_paths::user_root(&runs_root, &user);
    let registry = reconciled_registry(&user_root)?;
    Ok(Json(json!(registry.runs)).into_response())
}

pub(crate) async fn create_run_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    kill_switch_gate(&state)?;
    let user = request_user(&state, &headers, &method, &uri)?;
    let ctx = build_ctx(&state)?;
    let payload = parse_body(&body)?;

    let outcome = create_run(&ctx, &payload, &user)?;
    let status =
        StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(outcome.body)).into_response())
}

pub(crate) async fn run_manifest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let (run_dir, _) = gate_registered_run(&state, &user, &run_id)?;

    let manifest_path = run_dir.join("manifest.json");
    let text = std::fs::read_to_string(&manifest_path).map_err(|_| {
        ApiError::new(409, "RUN_CORRUPTED", "Run artifacts missing")
            .with_details(json!({"run_id": &run_id}))
    })?;
    let payload: Value = serde_json::from_str(&text).map_err(|_| {
        ApiError::new(409, "RUN_CORRUPTED", "Manifest invalid")
            .with_details(json!({"run_id": &run_id}))
    })?;
    Ok(Json(payload).into_response())
}

pub(crate) async fn run_artifact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path((run_id, name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    if !buff_paths::is_valid_component(&name) || name.starts_with('.') {
        return Err(ApiError::new(400, "RUN_CONFIG_INVALID", "Invalid artifact name")
            .with_details(json!({"name": name})));
    }
    let (run_dir, _) = gate_registered_run(&state, &user, &run_id)?;

    let artifact_path = run_dir.join(&name);
    if !buff_paths::is_within_root(&artifact_path, &run_dir) || !artifact_path.is_file() {
        return Err(ApiError::new(404, "ARTIFACT_NOT_FOUND", "Artifact not found")
            .with_details(json!({"run_id": &run_id, "name": &name})));
    }
    let bytes = std::fs::read(&artifact_path).map_err(|_| {
        ApiError::new(404, "ARTIFACT_NOT_FOUND", "Artifact not found")
            .with_details(json!({"run_id": &run_id, "name": &name}))
    })?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, artifact_media_type(&name))
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

fn artifact_media_type(name: &str) -> &'static str {
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with(".jsonl") || lowered.ends_with(".ndjson") {
        "application/x-ndjson; charset=utf-8"
    } else if lowered.ends_with(".json") {
        "application/json; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}

pub(crate) async fn run_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let decision_path = decisions_path_checked(&run_dir, &run_id)?;

    let mut summary = build_summary(&decision_path)?;
    summary["run_id"] = json!(run_id);
    summary["artifacts"] = json!(collect_run_artifacts(&run_dir));
    Ok(Json(summary).into_response())
}

pub(crate) async fn decisions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let decision_path = decisions_path_checked(&run_dir, &run_id)?;

    let filter = decision_filter(&params)?;
    let page = parse_page(&params)?;
    let payload = filter_decisions(&decision_path, &filter, page)?;
    Ok(Json(payload).into_response())
}

pub(crate) async fn decisions_export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let decision_path = decisions_path_checked(&run_dir, &run_id)?;

    let format = ExportFormat::parse(&single_value(&params, "format").unwrap_or("json".into()))?;
    let filter = decision_filter(&params)?;
    // Exports are unpaginated: stream everything the filter admits.
    let all = filter_decisions(
        &decision_path,
        &filter,
        Page {
            page: 1,
            page_size: 500,
        },
    )?;
    let mut records = all["results"].as_array().cloned().unwrap_or_default();
    let total = all["total"].as_u64().unwrap_or(0);
    let mut next_page = 2;
    while (records.len() as u64) < total {
        let more = filter_decisions(
            &decision_path,
            &filter,
            Page {
                page: next_page,
                page_size: 500,
            },
        )?;
        let batch = more["results"].as_array().cloned().unwrap_or_default();
        if batch.is_empty() {
            break;
        }
        records.extend(batch);
        next_page += 1;
    }

    let filename = format!("{run_id}-decisions.{}", format.extension());
    Ok(export_response(stream_export(records, format), format, &filename))
}

// ---------------------------------------------------------------------------
// Trades / OHLCV / metrics / timeline / errors
// ---------------------------------------------------------------------------

pub(crate) async fn trades(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let (start, end) = parse_time_range(&params)?;
    let page = parse_page(&params)?;
    let payload = load_trades(&run_dir, start, end, page)?;
    Ok(Json(payload).into_response())
}

pub(crate) async fn trade_markers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let (start, end) = parse_time_range(&params)?;
    let mut payload = load_trade_markers(&run_dir, start, end)?;
    payload["run_id"] = json!(run_id);
    Ok(Json(payload).into_response())
}

pub(crate) async fn trades_export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let format = ExportFormat::parse(&single_value(&params, "format").unwrap_or("json".into()))?;
    let (start, end) = parse_time_range(&params)?;

    let payload = load_trades(
        &run_dir,
        start,
        end,
        Page {
            page: 1,
            page_size: 500,
        },
    )?;
    let records = payload["results"].as_array().cloned().unwrap_or_default();
    let filename = format!("{run_id}-trades.{}", format.extension());
    Ok(export_response(stream_export(records, format), format, &filename))
}

pub(crate) async fn ohlcv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;

    let timeframe = single_value(&params, "timeframe");
    let path = resolve_ohlcv_path(&run_dir, timeframe.as_deref()).ok_or_else(|| {
        ApiError::new(404, "ohlcv_missing", "OHLCV artifact missing").with_details(json!({
            "run_id": &run_id,
            "timeframe": &timeframe,
        }))
    })?;

    let (start, end) = parse_time_range(&params)?;
    let limit = match single_value(&params, "limit") {
        None => None,
        Some(raw) => {
            let value: u64 = raw.parse().map_err(|_| {
                ApiError::new(422, "validation_error", "Request validation failed")
                    .with_details(json!({"param": "limit", "value": raw}))
            })?;
            if !(1..=10_000).contains(&value) {
                return Err(ApiError::new(
                    422,
                    "validation_error",
                    "Request validation failed",
                )
                .with_details(json!({"param": "limit", "value": value})));
            }
            Some(value)
        }
    };

    let mut payload = load_ohlcv(&path, start, end, limit)?;
    payload["run_id"] = json!(run_id);
    payload["timeframe"] = json!(single_value(&params, "timeframe"));
    payload["symbol"] = json!(single_value(&params, "symbol"));
    payload["source"] = json!(path.file_name().map(|n| n.to_string_lossy().into_owned()));
    Ok(Json(payload).into_response())
}

pub(crate) async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let mut payload = load_metrics(&run_dir)?;
    if payload.get("run_id").is_none() {
        payload["run_id"] = json!(run_id);
    }
    Ok(Json(payload).into_response())
}

pub(crate) async fn timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let source = single_value(&params, "source").unwrap_or_else(|| "auto".to_string());

    let events = match source.as_str() {
        "artifact" => load_timeline(&run_dir)?,
        "auto" if run_dir.join("timeline.json").is_file() => load_timeline(&run_dir)?,
        _ => {
            let decision_path = decisions_path_checked(&run_dir, &run_id)?;
            build_timeline_from_decisions(&decision_path)?
        }
    };
    Ok(Json(json!({
        "run_id": run_id,
        "total": events.len(),
        "events": events,
    }))
    .into_response())
}

pub(crate) async fn run_errors(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let decision_path = decisions_path_checked(&run_dir, &run_id)?;
    let records = collect_error_records(&decision_path)?;
    Ok(Json(json!({
        "run_id": run_id,
        "total": records.len(),
        "results": records,
    }))
    .into_response())
}

pub(crate) async fn errors_export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let run_dir = run_dir_of(&state, &user, &run_id)?;
    let decision_path = decisions_path_checked(&run_dir, &run_id)?;
    let format = ExportFormat::parse(&single_value(&params, "format").unwrap_or("json".into()))?;

    let records = collect_error_records(&decision_path)?;
    let filename = format!("{run_id}-errors.{}", format.extension());
    Ok(export_response(stream_export(records, format), format, &filename))
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

pub(crate) async fn create_experiment_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    body: Bytes,
) -> Result<Response, ApiError> {
    kill_switch_gate(&state)?;
    let user = request_user(&state, &headers, &method, &uri)?;
    let ctx = build_ctx(&state)?;
    let payload = parse_body(&body)?;

    let outcome = buff_experiments::create_experiment(&ctx, &payload, &user)?;
    let status =
        StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(outcome.body)).into_response())
}

pub(crate) async fn list_experiments_endpoint(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let runs_root = valid_runs_root(&state)?;
    let experiments = buff_experiments::list_experiments(&runs_root, &user);
    Ok(Json(json!({
        "total": experiments.len(),
        "experiments": experiments,
    }))
    .into_response())
}

async fn experiment_artifact(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    uri: &OriginalUri,
    experiment_id: &str,
    name: &str,
) -> Result<Response, ApiError> {
    let user = request_user(state, headers, method, uri)?;
    let runs_root = valid_runs_root(state)?;
    if !buff_paths::is_valid_component(experiment_id) {
        return Err(
            ApiError::new(400, "EXPERIMENT_CONFIG_INVALID", "Invalid experiment id")
                .with_details(json!({"experiment_id": experiment_id})),
        );
    }

    let experiments_root = buff_paths::user_experiments_root(&runs_root, &user);
    let path = experiments_root.join(experiment_id).join(name);
    if !buff_paths::is_within_root(&path, &experiments_root) || !path.is_file() {
        return Err(ApiError::new(404, "ARTIFACT_NOT_FOUND", "Artifact not found")
            .with_details(json!({"experiment_id": experiment_id, "name": name})));
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|_| ApiError::new(404, "ARTIFACT_NOT_FOUND", "Artifact not found"))?;
    let payload: Value = serde_json::from_str(&text)
        .map_err(|_| ApiError::new(422, "validation_error", "Artifact invalid"))?;
    Ok(Json(payload).into_response())
}

pub(crate) async fn experiment_manifest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(experiment_id): Path<String>,
) -> Result<Response, ApiError> {
    experiment_artifact(
        &state,
        &headers,
        &method,
        &uri,
        &experiment_id,
        "experiment_manifest.json",
    )
    .await
}

pub(crate) async fn experiment_comparison(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(experiment_id): Path<String>,
) -> Result<Response, ApiError> {
    experiment_artifact(
        &state,
        &headers,
        &method,
        &uri,
        &experiment_id,
        "comparison_summary.json",
    )
    .await
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

pub(crate) async fn observe_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let runs_root = valid_runs_root(&state)?;
    Ok(Json(buff_observe::observability_runs(&runs_root, &user)).into_response())
}

pub(crate) async fn observe_run_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let runs_root = valid_runs_root(&state)?;
    let payload = buff_observe::observability_run_detail(&runs_root, &user, &run_id)?;
    Ok(Json(payload).into_response())
}

pub(crate) async fn observe_registry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    method: Method,
    uri: OriginalUri,
) -> Result<Response, ApiError> {
    let user = request_user(&state, &headers, &method, &uri)?;
    let runs_root = valid_runs_root(&state)?;
    Ok(Json(buff_observe::observability_registry(&runs_root, &user)).into_response())
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

pub(crate) async fn admin_migrate(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let runs_root = valid_runs_root(&state)?;
    let default_user = state.auth.default_user.clone().ok_or_else(|| {
        ApiError::new(
            400,
            "USER_MISSING",
            "BUFF_DEFAULT_USER must be configured for migration",
        )
    })?;
    let report = migrate_legacy_runs(&runs_root, &default_user)?;
    info!(
        migrated = report.migrated.len(),
        skipped = report.skipped.len(),
        "legacy migration completed"
    );
    Ok(Json(report.to_body()).into_response())
}
