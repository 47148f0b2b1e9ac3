//! Run builder: request normalization, idempotency on the inputs hash,
//! simulation, canonical artifact emission, and registry upsert.

mod builder;
mod migrate;
mod request;

pub use builder::{
    check_writable, create_run, resolve_runs_root, BuildContext, RunOutcome, INITIAL_EQUITY,
};
pub use migrate::{migrate_legacy_runs, MigrationReport};
pub use request::{normalize_request, NormalizedDataSource, NormalizedRequest};

use serde_json::Value;

pub const ENGINE_VERSION: &str = "engine-1.0.0";
pub const BUILDER_VERSION: &str = "builder-1.0.0";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Tagged domain error threaded through the whole pipeline; the HTTP layer
/// converts it into the uniform envelope. Never carries a backtrace.
#[derive(Debug, Clone)]
pub struct RunError {
    pub code: &'static str,
    pub status: u16,
    pub message: String,
    pub details: Value,
}

impl RunError {
    pub fn new(code: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// `{code, message, details}` — the shape stored into experiment
    /// candidate records and error envelopes.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "code": self.code,
            "message": self.message,
            "details": self.details,
        })
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for RunError {}
