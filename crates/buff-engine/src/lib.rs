//! Deterministic bar-close simulation engine.
//!
//! Single-threaded, synchronous replay: every bar is one step, signals are
//! computed up front from the full series, and a signal emitted on bar `i`
//! executes on bar `i+1`'s open (no look-ahead). There is no RNG anywhere —
//! the request `seed` rides along in the normalized inputs for strategies
//! that would ask for randomness, and none of the built-ins do.

mod engine;
mod metrics;
mod strategy;

pub use engine::{run_engine, EngineConfig, EngineResult};
pub use metrics::EngineMetrics;
pub use strategy::{signal_actions, Strategy};

/// Engine failures; mapped to `RUN_CONFIG_INVALID` / `STRATEGY_INVALID` at
/// the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    EmptyData,
    InvalidParams(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EmptyData => write!(f, "engine received an empty bar series"),
            EngineError::InvalidParams(what) => write!(f, "{what}"),
        }
    }
}

impl std::error::Error for EngineError {}
