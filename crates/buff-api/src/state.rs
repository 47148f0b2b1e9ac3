//! Shared application state.
//!
//! Environment is read exactly once, here; handlers and the library crates
//! below never consult env vars. Tests construct the state directly with a
//! sandbox runs root.

use std::path::PathBuf;

use buff_auth::AuthConfig;

pub const DEFAULT_USER_ENV: &str = "BUFF_DEFAULT_USER";
pub const HMAC_SECRET_ENV: &str = "BUFF_USER_HMAC_SECRET";
pub const DEV_UI_PORT_ENV: &str = "DEV_UI_PORT";
pub const BIND_ADDR_ENV: &str = "BUFF_API_ADDR";

#[derive(Clone)]
pub struct AppState {
    /// `RUNS_ROOT`; `None` surfaces `RUNS_ROOT_UNSET` on every run API.
    pub runs_root: Option<PathBuf>,
    /// Root for repo-relative CSV paths (process cwd at startup).
    pub repo_root: PathBuf,
    pub auth: AuthConfig,
    /// Any `KILL_SWITCH*` env var set truthy blocks new-run creation.
    pub kill_switch: bool,
    /// Extra allowed CORS origin port for the dev UI.
    pub dev_ui_port: Option<u16>,
}

impl AppState {
    pub fn from_env() -> Self {
        let runs_root = std::env::var(buff_paths::RUNS_ROOT_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            runs_root,
            repo_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            auth: AuthConfig {
                default_user: non_empty_env(DEFAULT_USER_ENV),
                hmac_secret: non_empty_env(HMAC_SECRET_ENV),
            },
            kill_switch: kill_switch_engaged(),
            dev_ui_port: non_empty_env(DEV_UI_PORT_ENV).and_then(|v| v.parse().ok()),
        }
    }

    /// Bare test/state constructor with everything off.
    pub fn with_roots(runs_root: Option<PathBuf>, repo_root: PathBuf) -> Self {
        Self {
            runs_root,
            repo_root,
            auth: AuthConfig::default(),
            kill_switch: false,
            dev_ui_port: None,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// True when any `KILL_SWITCH*`-named env var holds a truthy value.
fn kill_switch_engaged() -> bool {
    std::env::vars().any(|(name, value)| {
        name.starts_with("KILL_SWITCH") && is_truthy(&value)
    })
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
