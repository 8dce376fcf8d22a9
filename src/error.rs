//! Error types for the prediction pipeline.
//!
//! One enum per concern. `StoreError` covers the SQLite gateway,
//! `ConfigError` covers `.repeat-predictor/config.toml`, and `PipelineError`
//! is the taxonomy the run orchestrator acts on.

use chrono::NaiveDate;

use crate::dates::format_dmy;
use crate::pipeline::RunState;

/// Errors raised by a record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("{0}")]
    Validation(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Pipeline failures.
///
/// `Connection` is fatal for the whole process; every other variant aborts
/// only the run it occurred in.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Window error: {0}")]
    Window(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Invalid run transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Connection(_))
    }

    /// Short category name used in log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Connection(_) => "ConnectionError",
            PipelineError::DataIntegrity(_) => "DataIntegrityError",
            PipelineError::Window(_) => "WindowError",
            PipelineError::Training(_) => "TrainingError",
            PipelineError::Store(_) => "StoreError",
            PipelineError::InvalidTransition { .. } => "StateError",
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Connection(msg) => PipelineError::Connection(msg),
            StoreError::Pool(e) => PipelineError::Connection(e.to_string()),
            other => PipelineError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A pipeline error tagged with the as-of date of the run that raised it.
#[derive(Debug)]
pub struct RunFailure {
    pub as_of: NaiveDate,
    pub error: PipelineError,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run as of {} failed: {}", format_dmy(self.as_of), self.error)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl RunFailure {
    pub fn new(as_of: NaiveDate, error: PipelineError) -> Self {
        Self { as_of, error }
    }

    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}
