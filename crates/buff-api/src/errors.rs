//! Conversion of domain errors into the uniform HTTP envelope.
//!
//! Every failure leaving this service has the same body shape (flat
//! `{code, message, details}` plus the `error` mirror and the structured
//! `error_envelope`). Unknown failures collapse to `INTERNAL` with a
//! correlation id logged server-side and never a stack trace on the wire.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

use buff_schemas::build_error_payload;

/// HTTP-ready error; constructible from every domain error type.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl ApiError {
    pub fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: code.to_string(),
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Catch-all for unexpected failures; logs the cause with a
    /// correlation id and hides it from the client.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = format!("err-{:016x}", fastrand_id());
        error!(%correlation_id, cause = %cause, "internal error");
        Self::new(500, "INTERNAL", "Internal error")
            .with_details(json!({"correlation_id": correlation_id}))
    }
}

/// Process-local monotonically unique id; enough to correlate a log line
/// with a response without any RNG dependency.
fn fastrand_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() as u64) << 32 | seq
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = build_error_payload(&self.code, &self.message, Some(&self.details));
        (self.status, Json(payload)).into_response()
    }
}

impl From<buff_runs::RunError> for ApiError {
    fn from(err: buff_runs::RunError) -> Self {
        ApiError::new(err.status, err.code, err.message).with_details(err.details)
    }
}

impl From<buff_artifacts::ResolveError> for ApiError {
    fn from(err: buff_artifacts::ResolveError) -> Self {
        ApiError::new(err.status, &err.code, err.message).with_details(err.details)
    }
}

impl From<buff_auth::AuthError> for ApiError {
    fn from(err: buff_auth::AuthError) -> Self {
        ApiError::new(err.status, err.code, err.message).with_details(err.details)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
