//! Error types for reportflow.
//!
//! Library crates use [`ReportflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all reportflow operations.
#[derive(Debug, thiserror::Error)]
pub enum ReportflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Embedding provider error (HTTP, decoding, dimension mismatch).
    #[error("embedding error: {0}")]
    Embedding(String),

    /// A stage agent failed while executing a job.
    #[error("agent error: {0}")]
    Agent(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed payload, invalid agent output, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ReportflowError>;

impl ReportflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an agent error from any displayable message.
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create a not-found error from any displayable message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ReportflowError::config("mmr_lambda must be within [0, 1]");
        assert_eq!(err.to_string(), "config error: mmr_lambda must be within [0, 1]");

        let err = ReportflowError::validation("payload is missing node_id");
        assert!(err.to_string().contains("node_id"));

        let err = ReportflowError::not_found("node 1.2");
        assert_eq!(err.to_string(), "not found: node 1.2");
    }
}
