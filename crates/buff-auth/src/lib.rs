//! User context resolution and optional request signatures.
//!
//! The primary identity is the `X-Buff-User` header, falling back to a
//! configured default user. When an HMAC secret is configured, every
//! request must also carry `X-Buff-Auth` (lowercase hex HMAC-SHA256 over
//! the canonical string) and `X-Buff-Timestamp` (unix seconds, bounded
//! skew). Signature comparison is constant-time via the mac verifier.

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

pub const USER_HEADER: &str = "x-buff-user";
pub const AUTH_HEADER: &str = "x-buff-auth";
pub const TIMESTAMP_HEADER: &str = "x-buff-timestamp";

pub const MAX_TIMESTAMP_SKEW_SECONDS: i64 = 300;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    /// `header_only`, `default_user`, or `hmac_sha256`.
    pub auth_mode: &'static str,
    pub used_default_user: bool,
}

/// Auth failure with the HTTP mapping carried along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub status: u16,
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl AuthError {
    fn new(status: u16, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: json!({}),
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Configuration slice the resolver needs; the HTTP layer builds this once
/// from the environment.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub default_user: Option<String>,
    pub hmac_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Canonical string signed by clients: `user\nMETHOD\npath\ntimestamp`.
/// The path is normalized: query stripped, trailing slash dropped.
pub fn canonical_auth_string(user_id: &str, method: &str, path: &str, timestamp: i64) -> String {
    format!(
        "{user_id}\n{}\n{}\n{timestamp}",
        method.to_ascii_uppercase(),
        normalize_path(path)
    )
}

fn normalize_path(path: &str) -> String {
    let no_query = path.split('?').next().unwrap_or(path);
    let trimmed = no_query.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolve the requesting user from headers (already lowercased keys).
///
/// `now_unix` is injected so skew checks stay testable; callers pass the
/// current unix time.
pub fn resolve_user_context(
    headers: &dyn Fn(&str) -> Option<String>,
    method: &str,
    path: &str,
    config: &AuthConfig,
    now_unix: i64,
) -> Result<UserContext, AuthError> {
    let mut used_default = false;
    let mut raw_user = headers(USER_HEADER).unwrap_or_default().trim().to_string();
    if raw_user.is_empty() {
        raw_user = config
            .default_user
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_string();
        if raw_user.is_empty() {
            return Err(AuthError::new(
                400,
                "USER_MISSING",
                "X-Buff-User header is required",
            ));
        }
        used_default = true;
    }

    if !buff_paths::is_valid_user_id(&raw_user) {
        return Err(AuthError::new(400, "USER_INVALID", "Invalid user id")
            .with_details(json!({"user_id": raw_user})));
    }

    let secret = match config.hmac_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => secret,
        None => {
            return Ok(UserContext {
                user_id: raw_user,
                auth_mode: if used_default {
                    "default_user"
                } else {
                    "header_only"
                },
                used_default_user: used_default,
            })
        }
    };

    let auth_header = headers(AUTH_HEADER).unwrap_or_default().trim().to_string();
    if auth_header.is_empty() {
        return Err(AuthError::new(
            401,
            "AUTH_MISSING",
            "X-Buff-Auth header is required",
        ));
    }

    let ts_header = headers(TIMESTAMP_HEADER)
        .unwrap_or_default()
        .trim()
        .to_string();
    if ts_header.is_empty() {
        return Err(AuthError::new(
            401,
            "TIMESTAMP_MISSING",
            "X-Buff-Timestamp header is required",
        ));
    }
    let timestamp: i64 = ts_header.parse().map_err(|_| {
        AuthError::new(
            401,
            "TIMESTAMP_INVALID",
            "X-Buff-Timestamp must be unix seconds",
        )
        .with_details(json!({"timestamp": ts_header}))
    })?;

    if (now_unix - timestamp).abs() > MAX_TIMESTAMP_SKEW_SECONDS {
        return Err(AuthError::new(
            401,
            "TIMESTAMP_INVALID",
            "X-Buff-Timestamp outside allowed skew",
        )
        .with_details(json!({
            "timestamp": timestamp,
            "now": now_unix,
            "max_skew_seconds": MAX_TIMESTAMP_SKEW_SECONDS,
        })));
    }

    let canonical = canonical_auth_string(&raw_user, method, path, timestamp);
    let provided = hex::decode(auth_header.to_ascii_lowercase()).map_err(|_| {
        AuthError::new(401, "AUTH_INVALID", "X-Buff-Auth signature invalid")
    })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthError::new(401, "AUTH_INVALID", "X-Buff-Auth signature invalid"))?;
    mac.update(canonical.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| AuthError::new(401, "AUTH_INVALID", "X-Buff-Auth signature invalid"))?;

    Ok(UserContext {
        user_id: raw_user,
        auth_mode: "hmac_sha256",
        used_default_user: used_default,
    })
}

/// Client-side signature helper (tests and the CLI use it).
pub fn sign_request(
    secret: &str,
    user_id: &str,
    method: &str,
    path: &str,
    timestamp: i64,
) -> String {
    let canonical = canonical_auth_string(user_id, method, path, timestamp);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn header_fn(map: HashMap<&'static str, String>) -> impl Fn(&str) -> Option<String> {
        move |name| map.get(name).cloned()
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn header_user_resolves_without_secret() {
        let headers = header_fn(HashMap::from([(USER_HEADER, "alice".to_string())]));
        let ctx =
            resolve_user_context(&headers, "GET", "/api/v1/runs", &AuthConfig::default(), NOW)
                .unwrap();
        assert_eq!(ctx.user_id, "alice");
        assert_eq!(ctx.auth_mode, "header_only");
        assert!(!ctx.used_default_user);
    }

    #[test]
    fn default_user_fallback() {
        let headers = header_fn(HashMap::new());
        let config = AuthConfig {
            default_user: Some("default-user".to_string()),
            hmac_secret: None,
        };
        let ctx = resolve_user_context(&headers, "GET", "/api/v1/runs", &config, NOW).unwrap();
        assert_eq!(ctx.user_id, "default-user");
        assert_eq!(ctx.auth_mode, "default_user");
        assert!(ctx.used_default_user);
    }

    #[test]
    fn missing_user_is_400() {
        let headers = header_fn(HashMap::new());
        let err = resolve_user_context(&headers, "GET", "/x", &AuthConfig::default(), NOW)
            .unwrap_err();
        assert_eq!(err.code, "USER_MISSING");
        assert_eq!(err.status, 400);
    }

    #[test]
    fn traversal_user_is_rejected() {
        let headers = header_fn(HashMap::from([(USER_HEADER, "../etc".to_string())]));
        let err = resolve_user_context(&headers, "GET", "/x", &AuthConfig::default(), NOW)
            .unwrap_err();
        assert_eq!(err.code, "USER_INVALID");
    }

    fn secret_config() -> AuthConfig {
        AuthConfig {
            default_user: None,
            hmac_secret: Some("s3cret".to_string()),
        }
    }

    #[test]
    fn valid_signature_accepted() {
        let signature = sign_request("s3cret", "alice", "get", "/api/v1/runs?page=2", NOW);
        let headers = header_fn(HashMap::from([
            (USER_HEADER, "alice".to_string()),
            (AUTH_HEADER, signature),
            (TIMESTAMP_HEADER, NOW.to_string()),
        ]));
        let ctx =
            resolve_user_context(&headers, "GET", "/api/v1/runs?page=2", &secret_config(), NOW)
                .unwrap();
        assert_eq!(ctx.auth_mode, "hmac_sha256");
    }

    #[test]
    fn path_normalization_ignores_query_and_trailing_slash() {
        let signature = sign_request("s3cret", "alice", "GET", "/api/v1/runs", NOW);
        let headers = header_fn(HashMap::from([
            (USER_HEADER, "alice".to_string()),
            (AUTH_HEADER, signature),
            (TIMESTAMP_HEADER, NOW.to_string()),
        ]));
        // Same canonical path despite query + trailing slash differences.
        let ctx = resolve_user_context(
            &headers,
            "GET",
            "/api/v1/runs/?page=3",
            &secret_config(),
            NOW,
        )
        .unwrap();
        assert_eq!(ctx.user_id, "alice");
    }

    #[test]
    fn bad_signature_rejected() {
        let headers = header_fn(HashMap::from([
            (USER_HEADER, "alice".to_string()),
            (AUTH_HEADER, "deadbeef".repeat(8)),
            (TIMESTAMP_HEADER, NOW.to_string()),
        ]));
        let err = resolve_user_context(&headers, "GET", "/x", &secret_config(), NOW).unwrap_err();
        assert_eq!(err.code, "AUTH_INVALID");
        assert_eq!(err.status, 401);
    }

    #[test]
    fn missing_auth_headers_reported_individually() {
        let headers = header_fn(HashMap::from([(USER_HEADER, "alice".to_string())]));
        let err = resolve_user_context(&headers, "GET", "/x", &secret_config(), NOW).unwrap_err();
        assert_eq!(err.code, "AUTH_MISSING");

        let headers = header_fn(HashMap::from([
            (USER_HEADER, "alice".to_string()),
            (AUTH_HEADER, "aa".to_string()),
        ]));
        let err = resolve_user_context(&headers, "GET", "/x", &secret_config(), NOW).unwrap_err();
        assert_eq!(err.code, "TIMESTAMP_MISSING");
    }

    #[test]
    fn skewed_timestamp_rejected() {
        let stale = NOW - MAX_TIMESTAMP_SKEW_SECONDS - 1;
        let signature = sign_request("s3cret", "alice", "GET", "/x", stale);
        let headers = header_fn(HashMap::from([
            (USER_HEADER, "alice".to_string()),
            (AUTH_HEADER, signature),
            (TIMESTAMP_HEADER, stale.to_string()),
        ]));
        let err = resolve_user_context(&headers, "GET", "/x", &secret_config(), NOW).unwrap_err();
        assert_eq!(err.code, "TIMESTAMP_INVALID");
    }
}
