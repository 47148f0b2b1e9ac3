//! Legacy layout migration: top-level `<runs_root>/<run_id>/` directories
//! (from before the per-user layout) move under the default user's runs
//! tree and are re-registered. Idempotent: already-migrated or conflicting
//! run ids are reported as skipped.

use std::fs;
use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use buff_registry::RegistryLock;

use crate::RunError;

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub migrated: Vec<String>,
    pub skipped: Vec<String>,
}

impl MigrationReport {
    pub fn to_body(&self) -> Value {
        json!({"migrated": self.migrated, "skipped": self.skipped})
    }
}

/// Move every legacy top-level run under `users/<default_user>/runs/`.
pub fn migrate_legacy_runs(
    runs_root: &Path,
    default_user: &str,
) -> Result<MigrationReport, RunError> {
    let user = default_user.trim();
    if user.is_empty() {
        return Err(RunError::new(
            "USER_MISSING",
            400,
            "BUFF_DEFAULT_USER must be configured for migration",
        ));
    }
    if !buff_paths::is_valid_user_id(user) {
        return Err(RunError::new("USER_INVALID", 400, "Invalid user id")
            .with_details(json!({"user_id": default_user})));
    }

    let user_root = buff_paths::user_root(runs_root, user);
    let target_runs = buff_paths::user_runs_root(runs_root, user);
    fs::create_dir_all(&target_runs)
        .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

    let mut report = MigrationReport::default();
    let entries = match fs::read_dir(runs_root) {
        Ok(entries) => entries,
        Err(e) => return Err(RunError::new("RUNS_ROOT_INVALID", 503, e.to_string())),
    };

    let mut candidates: Vec<String> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "users" || name.starts_with('.') {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }
        // Only directories that look like runs move; stray folders stay put.
        if !entry.path().join("manifest.json").is_file() {
            continue;
        }
        candidates.push(name);
    }
    candidates.sort();

    for run_id in candidates {
        let source = runs_root.join(&run_id);
        if !buff_paths::is_valid_run_id(&run_id) {
            report.skipped.push(run_id);
            continue;
        }
        let target = target_runs.join(&run_id);
        if target.exists() {
            report.skipped.push(run_id);
            continue;
        }
        fs::rename(&source, &target)
            .map_err(|e| RunError::new("RUN_WRITE_FAILED", 500, e.to_string()))?;

        if let Some(manifest) = read_manifest(&target) {
            let lock = RegistryLock::acquire(&user_root).map_err(|e| match e {
                buff_registry::RegistryError::LockTimeout => {
                    RunError::new("REGISTRY_LOCK_TIMEOUT", 503, "Registry lock timeout")
                }
                other => RunError::new("REGISTRY_WRITE_FAILED", 500, other.to_string()),
            })?;
            lock.upsert_entry(&target, &manifest).map_err(|e| {
                RunError::new("REGISTRY_WRITE_FAILED", 500, e.to_string())
            })?;
        }
        info!(run_id = %run_id, user = %user, "legacy run migrated");
        report.migrated.push(run_id);
    }

    Ok(report)
}

fn read_manifest(run_dir: &Path) -> Option<Value> {
    let text = fs::read_to_string(run_dir.join("manifest.json")).ok()?;
    serde_json::from_str(&text).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
