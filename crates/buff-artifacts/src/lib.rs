//! Read-only artifact resolvers: decisions, trades, OHLCV, metrics,
//! timeline, plus streaming exports. Nothing in this crate mutates a run
//! directory.

mod decisions;
mod export;
mod readers;

pub use decisions::{
    build_summary, build_timeline_from_decisions, collect_error_records, filter_decisions,
    validate_decision_records, DecisionFilter, DecisionRecords, Page,
};
pub use export::{export_media_type, stream_export, ExportFormat};
pub use readers::{load_metrics, load_ohlcv, load_timeline, load_trade_markers, load_trades};

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Resolver failure with its HTTP mapping (lowercase artifact codes).
#[derive(Debug, Clone)]
pub struct ResolveError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl ResolveError {
    pub fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ResolveError {}

// ---------------------------------------------------------------------------
// Run directory resolution
// ---------------------------------------------------------------------------

/// Resolve an existing run directory for one user, containment-checked.
/// A vanished directory is `RUN_NOT_FOUND`, never an IO error.
pub fn resolve_run_dir(
    runs_root: &Path,
    user_id: &str,
    run_id: &str,
) -> Result<PathBuf, ResolveError> {
    let dir = buff_paths::resolve_run_dir(runs_root, user_id, run_id).ok_or_else(|| {
        ResolveError::new(400, "RUN_CONFIG_INVALID", "Invalid run_id")
            .with_details(json!({"run_id": run_id}))
    })?;
    if !dir.is_dir() {
        return Err(ResolveError::new(404, "RUN_NOT_FOUND", "Run not found")
            .with_details(json!({"run_id": run_id})));
    }
    Ok(dir)
}

/// Pick the OHLCV artifact for a requested timeframe; `None` falls back to
/// the canonical 1m series.
pub fn resolve_ohlcv_path(run_dir: &Path, timeframe: Option<&str>) -> Option<PathBuf> {
    if let Some(tf) = timeframe {
        let candidate = run_dir.join(format!("ohlcv_{tf}.jsonl"));
        if candidate.is_file() {
            return Some(candidate);
        }
        return None;
    }
    let canonical = run_dir.join("ohlcv_1m.jsonl");
    canonical.is_file().then_some(canonical)
}

/// Sorted file listing of a run directory (artifact presence report).
pub fn collect_run_artifacts(run_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(run_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
