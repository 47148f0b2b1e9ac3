//! Shared fixtures for the scenario tests: deterministic CSV series, run
//! request payloads, and a disposable repo-root + runs-root sandbox.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tempfile::TempDir;

/// 2024-01-01T00:00:00.000Z — every fixture series starts here.
pub const BASE_TS_MS: i64 = 1_704_067_200_000;

// ---------------------------------------------------------------------------
// CSV builders
// ---------------------------------------------------------------------------

/// Consecutive 1-minute bars with the given `(open, close)` pairs;
/// high/low bracket them, volume fixed at 10.
pub fn minute_csv(bars: &[(f64, f64)]) -> String {
    let mut csv = String::from("timestamp,open,high,low,close,volume");
    for (i, (open, close)) in bars.iter().enumerate() {
        let ts = BASE_TS_MS + (i as i64) * 60_000;
        let high = open.max(*close);
        let low = open.min(*close);
        csv.push_str(&format!("\n{ts},{open},{high},{low},{close},10"));
    }
    csv.push('\n');
    csv
}

/// The five-bar hold scenario: closes 100, 100.5, 101, 100.8, 101.2.
pub fn sample_csv() -> String {
    minute_csv(&[
        (100.0, 100.0),
        (100.0, 100.5),
        (100.5, 101.0),
        (101.0, 100.8),
        (100.8, 101.2),
    ])
}

/// Ten bars where fast(2)/slow(3) averages cross up at bar 3 and back down
/// at bar 7.
pub fn cross_csv() -> String {
    minute_csv(&[
        (10.0, 10.0),
        (10.0, 10.0),
        (10.0, 10.0),
        (10.0, 14.0),
        (14.5, 14.0),
        (14.0, 14.0),
        (14.0, 14.0),
        (14.0, 6.0),
        (6.5, 6.0),
        (6.0, 6.0),
    ])
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// A valid run request for `path` (repo-relative) and `strategy`.
pub fn run_payload(path: &str, strategy: Value) -> Value {
    json!({
        "schema_version": "1.0.0",
        "data_source": {
            "type": "csv",
            "path": path,
            "symbol": "BTCUSDT",
            "timeframe": "1m",
        },
        "strategy": strategy,
        "risk": {"level": 3},
        "costs": {"commission_bps": 0.0, "slippage_bps": 0.0},
    })
}

pub fn hold_strategy() -> Value {
    json!({"id": "hold", "params": {}})
}

pub fn ma_cross_strategy(fast: u32, slow: u32) -> Value {
    json!({"id": "ma_cross", "params": {"fast_period": fast, "slow_period": slow}})
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Disposable repo root (CSV fixtures) + runs root (artifacts).
pub struct Sandbox {
    repo: TempDir,
    runs: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            repo: TempDir::new().expect("create repo tempdir"),
            runs: TempDir::new().expect("create runs tempdir"),
        }
    }

    pub fn repo_root(&self) -> &Path {
        self.repo.path()
    }

    pub fn runs_root(&self) -> &Path {
        self.runs.path()
    }

    /// Write a fixture under the repo root; returns its repo-relative path.
    pub fn write_fixture(&self, rel_path: &str, content: &str) -> String {
        let full = self.repo.path().join(rel_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("create fixture dir");
        }
        std::fs::write(&full, content).expect("write fixture");
        rel_path.to_string()
    }

    pub fn user_run_dir(&self, user: &str, run_id: &str) -> PathBuf {
        self.runs
            .path()
            .join("users")
            .join(user)
            .join("runs")
            .join(run_id)
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}
