//! Error types shared across the crate.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::StateVariable;

/// Errors raised while configuring or running a sampler.
///
/// Everything except [`McmcError::Io`] and [`McmcError::Persistence`] is a
/// configuration error and is reported before any chain iteration runs.
#[derive(Debug, Error)]
pub enum McmcError {
    #[error("Initial state is missing variable `{variable}` required by transition `{transition}`")]
    MissingStateVariable {
        variable: StateVariable,
        transition: String,
    },

    #[error("Invalid initial state: {0}")]
    InvalidInitState(String),

    #[error("Incompatible momentum transition: {0}")]
    IncompatibleMomentumTransition(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Chain results of ~{required} bytes exceed the transfer limit of {limit} bytes; \
         set `SampleOptions::memmap_dir` to persist traces to disk instead"
    )]
    TransferLimit { required: u64, limit: u64 },

    #[error("Failed to seed chain random number generator: {0}")]
    Rng(#[from] rand::Error),

    #[error("Persisted array `{path}` is invalid: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("Trace function returned inconsistent value for `{key}`: {reason}")]
    TraceShape { key: String, reason: String },

    #[error("Cannot compute diagnostics: {0}")]
    Diagnostics(String),

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(
        "Chain worker stopped without reporting a result{}",
        .0.map(|chain| format!(" for chain {chain}")).unwrap_or_default()
    )]
    WorkerFailed(Option<usize>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised by an [`Integrator`](crate::integrators::Integrator) when a step
/// leaves the region where the Hamiltonian is finite.
///
/// Integration transitions treat this as a rejected proposal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegratorError {
    #[error("Non-finite {quantity} after integration step")]
    NonFinite { quantity: &'static str },
}

pub type Result<T> = std::result::Result<T, McmcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_failed_names_chain_only_when_known() {
        assert_eq!(
            McmcError::WorkerFailed(Some(0)).to_string(),
            "Chain worker stopped without reporting a result for chain 0"
        );
        assert_eq!(
            McmcError::WorkerFailed(None).to_string(),
            "Chain worker stopped without reporting a result"
        );
    }
}
