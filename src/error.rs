//! Error types for `tickdb`.
//!
//! Every public operation returns [`StoreError`]. Storage failures of any kind
//! (statement errors, interrupted units, a closed worker, failing cache
//! callbacks) are folded into [`ExecutionError`] so callers only ever match on
//! three outcomes: the guarded context refused the call, the call timed out, or
//! execution failed.
//!
//! Both enums are `Clone`: a single failed load is delivered to every caller
//! that was waiting on it, so non-`Clone` sources are held behind `Arc`.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Primary error type.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A blocking call was attempted from the guarded context under `DISALLOW`.
    #[error("{operation} is not allowed on the guarded context")]
    GuardedContextDisallowed { operation: String },

    /// A guarded call exceeded its timeout under `FAIL_CLOSED` or `THROW`.
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("YAML error: {0}")]
    Yaml(#[source] Arc<serde_yaml::Error>),
}

/// Uniform wrapper around anything that went wrong while running a unit of
/// work on the storage worker.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("sqlite error: {0}")]
    Sqlite(#[source] Arc<rusqlite::Error>),

    /// The unit was cancelled before it started, or its statement was
    /// interrupted while running.
    #[error("unit of work was interrupted")]
    Interrupted,

    /// The storage worker has shut down and no longer accepts work.
    #[error("storage worker for {store} is not running")]
    WorkerUnavailable { store: String },

    #[error("unit of work panicked: {0}")]
    Panicked(String),

    /// A cache loader, writer or deleter failed.
    #[error("cache callback failed: {0}")]
    Callback(String),

    /// A migration step failed; the surrounding transaction was rolled back.
    #[error("migration to version {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Wrap an arbitrary callback failure as an execution error.
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::Callback(message.into()))
    }

    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::GuardedContextDisallowed { .. } => "GUARDED_CONTEXT_DISALLOWED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Execution(inner) => inner.code(),
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Yaml(_) => "CONFIG_PARSE_ERROR",
        }
    }

    /// Whether retrying the same call later could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Execution(ExecutionError::Interrupted) => true,
            Self::Execution(ExecutionError::Sqlite(err)) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// True when this error is the uniform "interrupted" execution failure.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Interrupted))
    }
}

impl ExecutionError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Interrupted => "INTERRUPTED",
            Self::WorkerUnavailable { .. } => "WORKER_UNAVAILABLE",
            Self::Panicked(_) => "UNIT_PANICKED",
            Self::Callback(_) => "CALLBACK_FAILED",
            Self::Migration { .. } => "MIGRATION_FAILED",
        }
    }
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(err: rusqlite::Error) -> Self {
        // An interrupted statement surfaces as the same kind as a cancelled unit.
        if err.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) {
            return Self::Interrupted;
        }
        Self::Sqlite(Arc::new(err))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Execution(err.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(Arc::new(err))
    }
}
