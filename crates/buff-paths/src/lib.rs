//! Identifier validation and the per-user filesystem layout.
//!
//! Layout under `RUNS_ROOT`:
//!
//! ```text
//! <runs_root>/
//!   users/<user_id>/
//!     runs/<run_id>/...
//!     experiments/<experiment_id>/...
//!     inputs/...
//!     index.json
//!     .registry.lock
//! ```
//!
//! All identifiers are single path components. Validators reject `.`, `..`,
//! any separator (including URL-encoded dot sequences), and enforce the
//! length/charset rules; resolvers re-check containment after joining so an
//! escape can never depend on a validator bug alone.

use std::path::{Component, Path, PathBuf};

pub const RUNS_ROOT_ENV: &str = "RUNS_ROOT";
pub const REGISTRY_FILENAME: &str = "index.json";
pub const REGISTRY_LOCK_FILENAME: &str = ".registry.lock";

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

/// True when `value` is a safe single path component:
/// 1-64 chars of `[A-Za-z0-9._-]`, not `.` or `..`, no separators.
pub fn is_valid_component(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() || v == "." || v == ".." || v.len() > 64 {
        return false;
    }
    if contains_encoded_escape(v) {
        return false;
    }
    v.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// User ids share the component rule (`[A-Za-z0-9._-]{1,64}`).
pub fn is_valid_user_id(value: &str) -> bool {
    is_valid_component(value)
}

/// Run ids: `^[a-z0-9][a-z0-9_-]{2,63}$`.
pub fn is_valid_run_id(value: &str) -> bool {
    let v = value.trim();
    let bytes = v.as_bytes();
    if bytes.len() < 3 || bytes.len() > 64 {
        return false;
    }
    let head_ok = bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit();
    head_ok
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

/// Candidate ids: `^[a-z0-9][a-z0-9_-]{2,31}$`.
pub fn is_valid_candidate_id(value: &str) -> bool {
    let v = value.trim();
    v.len() <= 32 && is_valid_run_id(v)
}

/// URL-encoded dot or separator sequences (`%2e`, `%2f`, `%5c`) are
/// rejected outright; decoded they would smuggle `..` or a separator past
/// the charset check.
fn contains_encoded_escape(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.contains("%2e") || lower.contains("%2f") || lower.contains("%5c")
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

pub fn users_root(runs_root: &Path) -> PathBuf {
    runs_root.join("users")
}

pub fn user_root(runs_root: &Path, user_id: &str) -> PathBuf {
    users_root(runs_root).join(user_id)
}

pub fn user_runs_root(runs_root: &Path, user_id: &str) -> PathBuf {
    user_root(runs_root, user_id).join("runs")
}

pub fn user_experiments_root(runs_root: &Path, user_id: &str) -> PathBuf {
    user_root(runs_root, user_id).join("experiments")
}

pub fn user_uploads_root(runs_root: &Path, user_id: &str) -> PathBuf {
    user_root(runs_root, user_id).join("inputs")
}

pub fn user_registry_path(runs_root: &Path, user_id: &str) -> PathBuf {
    user_root(runs_root, user_id).join(REGISTRY_FILENAME)
}

pub fn user_registry_lock_path(runs_root: &Path, user_id: &str) -> PathBuf {
    user_root(runs_root, user_id).join(REGISTRY_LOCK_FILENAME)
}

/// `users/<user>/runs/<run_id>` for a pre-validated pair, with a containment
/// re-check. Returns `None` when either id or the resolved path is unsafe.
pub fn resolve_run_dir(runs_root: &Path, user_id: &str, run_id: &str) -> Option<PathBuf> {
    if !is_valid_user_id(user_id) || !is_valid_run_id(run_id) {
        return None;
    }
    let runs = user_runs_root(runs_root, user_id);
    let candidate = normalize_lexical(&runs.join(run_id));
    if is_within_root(&candidate, &normalize_lexical(&runs)) {
        Some(candidate)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Containment
// ---------------------------------------------------------------------------

/// Prefix containment on lexically normalized paths.
pub fn is_within_root(candidate: &Path, root: &Path) -> bool {
    let candidate = normalize_lexical(candidate);
    let root = normalize_lexical(root);
    candidate.starts_with(&root)
}

/// Resolve `.` and `..` components without touching the filesystem.
/// A `..` that would climb past the start of the path is preserved so the
/// containment check fails instead of silently re-anchoring.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
