//! Error types for the fan-out core
//!
//! ## Table of Contents
//! - **FanoutError**: Main error enum covering all hard failure modes
//! - **BackendError**: Orchestration backend failure with retry classification
//! - **Result**: Type alias for `Result<T, FanoutError>`
//!
//! Per-spec and per-branch failures are *not* errors here; they travel as data
//! (`SpecFailure`, `IncompleteBranch`) so a run always produces an inspectable
//! result.

use thiserror::Error;

/// Result type alias for fan-out operations
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Main error type for fan-out operations
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Bad planning or runtime parameters, surfaced before any submission
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Backend unreachable after all retries for one branch
    #[error("submission failed for branch {branch}: {reason}")]
    SubmissionFailure {
        /// Branch index that could not be submitted
        branch: usize,
        /// Last backend error message
        reason: String,
    },

    /// A single building failed to simulate
    #[error("spec {spec_id} failed: {message}")]
    SpecExecutionFailure {
        /// Failing spec id
        spec_id: String,
        /// Engine message
        message: String,
    },

    /// No branch completed before the run-level timeout
    #[error("aggregation timed out for run {run}: no branch completed within {timeout_secs}s")]
    AggregationTimeout {
        /// Run name
        run: String,
        /// Configured timeout
        timeout_secs: u64,
    },

    /// Every branch of a run ended without a result
    #[error("aggregation failed for run {run}: none of {branches} branches completed ({reason})")]
    AggregationFailed {
        /// Run name
        run: String,
        /// Branches polled
        branches: usize,
        /// First failure reason
        reason: String,
    },

    /// A concurrent publish already claimed the version path
    #[error("version collision: {path} already exists")]
    VersionCollision {
        /// Storage path that already existed
        path: String,
    },

    /// Requested run, version or dataframe does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Orchestration backend failure
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Storage layer failure (object store or state store)
    #[error("storage error: {0}")]
    Storage(String),

    /// Merged data violates a partition invariant
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// Run-level cancellation was raised
    #[error("operation cancelled")]
    Cancelled,

    /// Metrics registration or export failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Binary or CSV encoding failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML manifest parsing error
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),
}

impl FanoutError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a data-integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Whether this error is fatal to the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SubmissionFailure { .. } | Self::SpecExecutionFailure { .. }
        )
    }
}

impl From<prometheus::Error> for FanoutError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

impl From<bincode::Error> for FanoutError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<csv::Error> for FanoutError {
    fn from(err: csv::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Failure talking to the orchestration backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Timeouts, connection resets, 5xx responses
    #[error("transient: {0}")]
    Transient(String),

    /// Rejected request, unknown handle, 4xx responses
    #[error("permanent: {0}")]
    Permanent(String),
}

impl BackendError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        let server_side = err.status().map(|s| s.is_server_error()).unwrap_or(false);
        if err.is_timeout() || err.is_connect() || server_side {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}
