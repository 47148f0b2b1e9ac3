//! Per-user run registry: `users/<user>/index.json`.
//!
//! The registry is the only mutable shared state in the system. Every write
//! happens under an OS advisory lock (`.registry.lock`) and lands via
//! canonical-bytes + temp-file + rename, so readers never observe a torn
//! index. Reads are tolerant: a missing or corrupt index loads as empty and
//! is repaired by the next write.
//!
//! Holding a [`RegistryLock`] is the capability to mutate; the write
//! operations are methods on the lock so an unlocked write cannot compile.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde_json::Value;
use tracing::debug;

use buff_schemas::{Registry, RegistryEntry, REGISTRY_SCHEMA_VERSION, REQUIRED_ARTIFACTS};

/// Hard timeout for lock acquisition (`REGISTRY_LOCK_TIMEOUT` at the API).
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_POLL: Duration = Duration::from_millis(50);

pub const STATUS_CORRUPTED: &str = "CORRUPTED";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RegistryError {
    /// Another writer held the lock for the whole timeout window.
    LockTimeout,
    /// Lock file could not be created/opened.
    LockIo(String),
    /// Registry write failed (canonical encode or filesystem).
    WriteFailed(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::LockTimeout => write!(f, "registry lock timeout"),
            RegistryError::LockIo(msg) => write!(f, "registry lock io: {msg}"),
            RegistryError::WriteFailed(msg) => write!(f, "registry write failed: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Exclusive advisory lock over one user's registry.
pub struct RegistryLock {
    user_root: PathBuf,
    file: fs::File,
}

impl RegistryLock {
    /// Acquire with the standard 2 s timeout.
    pub fn acquire(user_root: &Path) -> Result<Self, RegistryError> {
        Self::acquire_with_timeout(user_root, LOCK_TIMEOUT)
    }

    /// Non-blocking attempts with a short sleep until `timeout` elapses.
    pub fn acquire_with_timeout(
        user_root: &Path,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        fs::create_dir_all(user_root).map_err(|e| RegistryError::LockIo(e.to_string()))?;
        let lock_path = user_root.join(buff_paths::REGISTRY_LOCK_FILENAME);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&lock_path)
            .map_err(|e| RegistryError::LockIo(e.to_string()))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        user_root: user_root.to_path_buf(),
                        file,
                    })
                }
                Err(_) if start.elapsed() >= timeout => return Err(RegistryError::LockTimeout),
                Err(_) => std::thread::sleep(LOCK_POLL),
            }
        }
    }

    pub fn user_root(&self) -> &Path {
        &self.user_root
    }

    /// Replace-or-append the entry for `run_dir`'s run, keeping `runs`
    /// sorted by `run_id`.
    pub fn upsert_entry(
        &self,
        run_dir: &Path,
        manifest: &Value,
    ) -> Result<RegistryEntry, RegistryError> {
        let mut registry = load_registry(&self.user_root);
        let entry = build_registry_entry(run_dir, manifest);

        match registry
            .runs
            .iter_mut()
            .find(|existing| existing.run_id == entry.run_id)
        {
            Some(existing) => *existing = entry.clone(),
            None => registry.runs.push(entry.clone()),
        }
        registry.runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));

        if registry.generated_at.is_none() {
            registry.generated_at = manifest
                .get("created_at")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        self.write_registry(&registry)?;
        Ok(entry)
    }

    /// Read-only sweep over all registered runs: refresh `status`,
    /// `artifacts_present` and `missing_artifacts` from disk. Writes the
    /// index back only when drift was detected.
    pub fn reconcile(&self) -> Result<Registry, RegistryError> {
        let mut registry = load_registry(&self.user_root);
        let runs_root = self.user_root.join("runs");
        let mut drifted = false;

        for entry in &mut registry.runs {
            let run_dir = runs_root.join(&entry.run_id);
            if !buff_paths::is_within_root(&run_dir, &runs_root) || !run_dir.is_dir() {
                if entry.status != STATUS_CORRUPTED {
                    entry.status = STATUS_CORRUPTED.to_string();
                    drifted = true;
                }
                continue;
            }

            let (missing, present) = scan_artifacts(&run_dir);
            if present != entry.artifacts_present {
                entry.artifacts_present = present;
                drifted = true;
            }
            if !missing.is_empty() {
                if entry.status != STATUS_CORRUPTED {
                    entry.status = STATUS_CORRUPTED.to_string();
                    drifted = true;
                }
                if entry.missing_artifacts.as_deref() != Some(&missing[..]) {
                    entry.missing_artifacts = Some(missing);
                    drifted = true;
                }
            }
        }

        registry.runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        if drifted {
            debug!(user_root = %self.user_root.display(), "registry drift repaired");
            self.write_registry(&registry)?;
        }
        Ok(registry)
    }

    fn write_registry(&self, registry: &Registry) -> Result<(), RegistryError> {
        let path = self.user_root.join(buff_paths::REGISTRY_FILENAME);
        buff_canon::atomic_write_canonical_json(&path, registry)
            .map_err(|e| RegistryError::WriteFailed(e.to_string()))
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// Reads (lock-free, tolerant)
// ---------------------------------------------------------------------------

/// Load the registry; a missing or unreadable index is an empty registry.
pub fn load_registry(user_root: &Path) -> Registry {
    let path = user_root.join(buff_paths::REGISTRY_FILENAME);
    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => return Registry::default(),
    };
    match serde_json::from_str::<Registry>(&text) {
        Ok(mut registry) => {
            if registry.schema_version.is_empty() {
                registry.schema_version = REGISTRY_SCHEMA_VERSION.to_string();
            }
            registry
        }
        Err(_) => Registry::default(),
    }
}

pub fn get_registry_entry(user_root: &Path, run_id: &str) -> Option<RegistryEntry> {
    load_registry(user_root)
        .runs
        .into_iter()
        .find(|entry| entry.run_id == run_id)
}

/// Build an entry from the run directory state plus its manifest fields.
/// Missing required artifacts force `CORRUPTED` regardless of the manifest.
pub fn build_registry_entry(run_dir: &Path, manifest: &Value) -> RegistryEntry {
    let run_id = manifest
        .get("run_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

    let (missing, present) = scan_artifacts(run_dir);
    let status = if !missing.is_empty() {
        STATUS_CORRUPTED.to_string()
    } else {
        manifest
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("COMPLETED")
            .to_string()
    };

    let data = manifest.get("data");
    RegistryEntry {
        manifest_path: format!("{run_id}/manifest.json"),
        run_id,
        created_at: str_field(manifest.get("created_at")),
        symbol: str_field(data.and_then(|d| d.get("symbol"))),
        timeframe: str_field(data.and_then(|d| d.get("timeframe"))),
        status,
        artifacts_present: present,
        inputs_hash: str_field(manifest.get("inputs_hash")),
        strategy_id: str_field(manifest.get("strategy").and_then(|s| s.get("id"))),
        missing_artifacts: if missing.is_empty() {
            None
        } else {
            Some(missing)
        },
    }
}

/// `(missing required artifacts, files present sorted)`.
pub fn scan_artifacts(run_dir: &Path) -> (Vec<String>, Vec<String>) {
    let missing: Vec<String> = REQUIRED_ARTIFACTS
        .iter()
        .filter(|name| !run_dir.join(name).is_file())
        .map(|name| name.to_string())
        .collect();

    let mut present: Vec<String> = Vec::new();
    if let Ok(entries) = fs::read_dir(run_dir) {
        for entry in entries.flatten() {
            if entry.path().is_file() {
                present.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    present.sort();
    (missing, present)
}

fn str_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
