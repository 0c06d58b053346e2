use std::error::Error as StdError;

use thiserror::Error;

use crate::types::ClusterIndex;

/// Rejected `MatrixConfig`. The simulation never starts with one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("n_clusters must be at least 1")]
    NoClusters,
    #[error("{field} must not be negative, got {value}")]
    NegativeDays { field: &'static str, value: i64 },
    #[error("time window is empty: days_past + days_future must be positive")]
    EmptyWindow,
    #[error("max_radius override must not be negative, got {0}")]
    NegativeRadius(i64),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum RandomizationError {
    #[error("population has {population} items but {weights} weights were given")]
    LengthMismatch { population: usize, weights: usize },
    #[error("invalid weights: {0}")]
    InvalidWeights(String),
}

/// The product model asked for something its own state forbids.
/// These indicate a broken model and abort the run.
#[derive(Debug, Error, PartialEq)]
pub enum InvariantViolation {
    #[error("there is no successor to plan {0}")]
    NoSuccessorPlan(&'static str),
    #[error("there is no predecessor to plan {0}")]
    NoPredecessorPlan(&'static str),
    #[error("intent {intent} requires {requirement}")]
    IntentUnavailable { intent: String, requirement: &'static str },
    #[error("group type limit of {limit} exceeded by {group_type:?}")]
    TooManyGroupTypes { group_type: String, limit: usize },
    #[error(transparent)]
    Randomization(#[from] RandomizationError),
}

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invariant violated in cluster {cluster} (seed {seed:?})")]
    Invariant {
        seed: String,
        cluster: usize,
        #[source]
        source: InvariantViolation,
    },
    #[error("matrix has already been simulated")]
    AlreadySimulated,
}

impl MatrixError {
    pub fn invariant(seed: &str, cluster: ClusterIndex, source: InvariantViolation) -> Self {
        MatrixError::Invariant { seed: seed.to_string(), cluster: cluster.0, source }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("matrix must be simulated before it is persisted")]
    NotSimulated,
}

/// `err` followed by each of its sources, outermost first.
pub fn error_chain(err: &dyn StdError) -> Vec<String> {
    std::iter::successors(Some(err), |&e| e.source()).map(ToString::to_string).collect()
}
