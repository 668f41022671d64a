//! Unified error types for Convoy.

use serde::Serialize;
use thiserror::Error;

/// Main error type for coordinator operations.
///
/// Version conflicts are deliberately *not* represented here: a conflict is
/// an expected outcome of a conditional write and is modeled as a
/// `WriteOutcome` variant, not an error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// Transient failure talking to the authoritative store (timeout,
    /// connection refused). Retried by the owning loop; never fatal.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// A write was attempted with a fencing term that is no longer current.
    /// Rejected locally, before any network call.
    #[error("Fencing rejected: write term {write_term} superseded by {current_term}")]
    FencingRejected { write_term: i64, current_term: i64 },

    /// Entity not found in the authoritative store.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Configuration loading or validation failed. Fatal at startup only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Serialize for CoordinatorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl CoordinatorError {
    /// Whether the error is worth retrying with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

/// Result type alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fencing_error_message_names_both_terms() {
        let err = CoordinatorError::FencingRejected {
            write_term: 3,
            current_term: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_only_store_errors_are_transient() {
        assert!(CoordinatorError::TransientStore("timeout".into()).is_transient());
        assert!(!CoordinatorError::Config("bad ttl".into()).is_transient());
        assert!(!CoordinatorError::NotFound("k".into()).is_transient());
    }
}
