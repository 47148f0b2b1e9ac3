//! Wire/disk types shared across the run pipeline.
//!
//! These are plain serde structs; the canonical byte layout (key order,
//! float policy) is applied by `buff-canon` at write time, so the structs
//! stay declaration-ordered and readable here.
//!
//! Timestamps are always pre-formatted canonical strings by the time they
//! reach these types; no wall-clock values appear anywhere.

pub mod envelope;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use envelope::{build_error_envelope, build_error_payload, recovery_hint, STAGE_TOKEN};

pub const DECISION_SCHEMA_VERSION: &str = "dr.v1";
pub const EXECUTION_MODE_SIM_ONLY: &str = "SIM_ONLY";
pub const CAPABILITIES: [&str; 2] = ["SIMULATION", "DATA_READONLY"];

/// The seven files a run directory must contain to be considered intact.
pub const REQUIRED_ARTIFACTS: [&str; 7] = [
    "manifest.json",
    "config.json",
    "metrics.json",
    "equity_curve.json",
    "trades.jsonl",
    "timeline.json",
    "decision_records.jsonl",
];

// ---------------------------------------------------------------------------
// Engine output records
// ---------------------------------------------------------------------------

/// Per-bar trading action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Hold,
    EnterLong,
    ExitLong,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Hold => "HOLD",
            Action::EnterLong => "ENTER_LONG",
            Action::ExitLong => "EXIT_LONG",
        }
    }
}

/// One decision per bar, in strictly increasing `seq` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub schema_version: String,
    /// Stamped by the run builder after the engine pass.
    pub run_id: Option<String>,
    pub seq: u64,
    pub ts_utc: String,
    pub action: Action,
    pub price: f64,
    pub symbol: String,
    pub timeframe: String,
    pub strategy_id: String,
    pub risk_level: i64,
}

/// A closed long round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: String,
    pub entry_price: f64,
    pub exit_time: String,
    pub exit_price: f64,
    pub qty: f64,
    pub pnl: f64,
    pub fees: f64,
    pub side: String,
}

/// Mark-to-market equity after each bar close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub t: String,
    pub equity: f64,
}

/// One OHLCV bar as persisted in `ohlcv_<tf>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvRow {
    pub ts: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One run-lifecycle event in `timeline.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub title: String,
    pub detail: String,
    pub severity: String,
    pub stage: String,
    pub duration_ms: i64,
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostsSpec {
    pub commission_bps: f64,
    pub slippage_bps: f64,
}

/// `metrics.json` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub num_records: u64,
    pub win_rate: f64,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub num_trades: u64,
    pub symbol: String,
    pub timeframe: String,
    pub strategy_id: String,
    pub costs: CostsSpec,
    pub risk_level: i64,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestData {
    pub source_type: String,
    pub source_path: String,
    pub symbol: String,
    pub timeframe: String,
    /// Requested window bounds; `null` when the request had none.
    pub start_ts: Option<String>,
    pub end_ts: Option<String>,
    pub canonical_timeframe: String,
    pub data_start_ts: String,
    pub data_end_ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStrategy {
    pub id: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRisk {
    pub level: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestArtifacts {
    pub decision_records: String,
    pub metrics: String,
    pub timeline: String,
    pub additional: Vec<String>,
}

/// Invariant envelope of one run (`manifest.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub run_id: String,
    /// First bar's timestamp, not wall-clock.
    pub created_at: String,
    pub engine_version: String,
    pub builder_version: String,
    pub status: String,
    pub status_history: Vec<String>,
    pub inputs: Value,
    pub inputs_hash: String,
    pub data: ManifestData,
    pub strategy: ManifestStrategy,
    pub risk: ManifestRisk,
    pub artifacts: ManifestArtifacts,
    pub execution_mode: String,
    pub capabilities: Vec<String>,
    pub meta: Value,
}

/// `config.json` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub schema_version: String,
    pub run_id: String,
    pub engine_version: String,
    pub builder_version: String,
    pub inputs: Value,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub const REGISTRY_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub run_id: String,
    pub created_at: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub status: String,
    pub manifest_path: String,
    pub artifacts_present: Vec<String>,
    pub inputs_hash: Option<String>,
    pub strategy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_artifacts: Option<Vec<String>>,
}

/// `users/<user>/index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub schema_version: String,
    pub generated_at: Option<String>,
    pub runs: Vec<RegistryEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            schema_version: REGISTRY_SCHEMA_VERSION.to_string(),
            generated_at: None,
            runs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentCounts {
    pub total_candidates: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Outcome of one candidate inside an experiment manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateResult {
    pub candidate_index: u64,
    pub candidate_id: String,
    pub status: String,
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
    /// Structured error payload `{code, message, details}`; never a trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentArtifacts {
    pub manifest: String,
    pub comparison: String,
}

/// `experiment_manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentManifest {
    pub schema_version: String,
    pub experiment_id: String,
    pub experiment_digest: String,
    pub status: String,
    pub status_history: Vec<String>,
    pub execution_mode: String,
    pub capabilities: Vec<String>,
    pub inputs: Value,
    pub candidates: Vec<CandidateResult>,
    pub summary: ExperimentCounts,
    pub artifacts: ExperimentArtifacts,
    pub meta: Value,
}

/// One row of `comparison_summary.json`; scalars are copied verbatim from
/// the candidate run's `metrics.json`, never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub candidate_index: u64,
    pub candidate_id: String,
    pub run_id: String,
    pub status: String,
    pub strategy_id: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub risk_level: Option<i64>,
    pub total_return: Option<f64>,
    pub final_equity: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub win_rate: Option<f64>,
    pub num_trades: Option<i64>,
}

/// Fixed column order of the comparison summary.
pub const COMPARISON_COLUMNS: [&str; 13] = [
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
];

/// `comparison_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonSummary {
    pub schema_version: String,
    pub experiment_id: String,
    pub experiment_digest: String,
    pub status: String,
    pub counts: ExperimentCounts,
    pub columns: Vec<String>,
    pub rows: Vec<ComparisonRow>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
