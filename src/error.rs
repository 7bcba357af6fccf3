use thiserror::Error;

/// Schema and configuration failures that abort a build.
///
/// These are never downgraded to a fallback value: a caller that gets one of
/// these has no table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("target field '{target}' is not part of the record schema")]
    EmptySchema { target: String },

    #[error("target field '{target}' has no non-null value in the training set")]
    EmptyTarget { target: String },

    #[error("malformed cascade definition: {0}")]
    MalformedCascadeDefinition(String),

    #[error("tier '{tier}' exceeded its build budget: {reason}")]
    TierBudgetExceeded { tier: String, reason: String },
}

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Corrupt cascade table: {0}")]
    CorruptTable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::prelude::PolarsError> for CascadeError {
    fn from(e: polars::prelude::PolarsError) -> Self {
        CascadeError::Polars(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;
