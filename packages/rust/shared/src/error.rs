//! Error types for enrichkit.
//!
//! Library crates use [`EnrichError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! [`LookupError`] is the per-lookup outcome classification. It is not a
//! failure of the run: the pipeline decides between retry and terminal
//! failure based on [`LookupError::is_transient`].

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all enrichkit operations.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a classified lookup.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Optimistic concurrency check failed on a state save.
    #[error("stale state for record {record_id}: expected version {expected}")]
    StaleVersion { record_id: String, expected: i64 },

    /// A status change that the record state machine does not allow.
    #[error("invalid transition for record {record_id}: {from} -> {to}")]
    InvalidTransition {
        record_id: String,
        from: String,
        to: String,
    },

    /// Work stack error (bad URL, backend failure).
    #[error("stack error: {0}")]
    Stack(String),

    /// A classified lookup failure surfaced outside the pipeline.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad record input, unknown kind, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EnrichError>;

impl EnrichError {
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

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any backend error as a storage error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Whether a lookup failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Classified outcome of a failed lookup.
///
/// Cloneable so that single-flight waiters can share the leader's failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The adapter did not answer within the per-call timeout.
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    /// The provider throttled us.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or 5xx-equivalent response.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source has no result for this input.
    #[error("not found: {0}")]
    NotFound(String),

    /// The record lacks the attributes this lookup needs.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The adapter answered with an empty or garbage payload.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LookupError {
    /// Retry classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) | Self::Unavailable(_) => ErrorClass::Transient,
            Self::NotFound(_) | Self::MalformedInput(_) | Self::InvalidResponse(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = EnrichError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = EnrichError::StaleVersion {
            record_id: "sub-1".into(),
            expected: 4,
        };
        assert!(err.to_string().contains("expected version 4"));
    }

    #[test]
    fn lookup_error_classification() {
        assert!(LookupError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LookupError::RateLimited("429".into()).is_transient());
        assert!(LookupError::Unavailable("502".into()).is_transient());
        assert!(!LookupError::NotFound("no profile".into()).is_transient());
        assert!(!LookupError::MalformedInput("no email".into()).is_transient());
        assert_eq!(
            LookupError::InvalidResponse("empty".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn lookup_error_converts_into_enrich_error() {
        let err: EnrichError = LookupError::NotFound("x".into()).into();
        assert_eq!(err.to_string(), "not found: x");
    }
}
