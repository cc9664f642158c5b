//! Error taxonomy for the synchronizer.
//!
//! Transport failures are recoverable per refresh pass and are retried on the
//! next poll. Protocol failures indicate client/server skew that cannot be
//! repaired locally. Cancellation is a clean outcome, never a failure.

use thiserror::Error;

/// Violations of the result-row contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("missing field '{field}' in result row")]
    MissingField { field: &'static str },

    #[error("malformed value for '{field}': '{value}'")]
    Malformed { field: &'static str, value: String },

    #[error("id {id} does not carry a {expected} tag")]
    IdTag { id: i64, expected: &'static str },

    #[error("query returned more rows than the requested limit of {limit}")]
    RowOverrun { limit: u64 },

    #[error("expected a single result row, got none")]
    EmptyResult,
}

/// Top-level error type for query and selection operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Connection-level failure. The engine loop swallows these and retries
    /// on the next periodic trigger.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed or contract-violating server response.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The in-flight command was aborted, either explicitly or because a
    /// newer refresh superseded it.
    #[error("query aborted")]
    Aborted,

    /// Invalid configuration or logging setup.
    #[error("configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// True when the error terminates a pass cleanly rather than failing it.
    pub fn is_abort(&self) -> bool {
        matches!(self, SyncError::Aborted)
    }
}
