//! Experiment orchestrator: a fingerprinted set of candidate run configs,
//! executed in order through the run builder, with partial-failure
//! semantics and a deterministic comparison summary.

mod builder;
mod contract;

pub use builder::{create_experiment, list_experiments, ExperimentOutcome};
pub use contract::{
    normalize_experiment_request, NormalizedCandidate, NormalizedExperiment,
    EXPERIMENT_SCHEMA_VERSION, MAX_EXPERIMENT_CANDIDATES,
};
