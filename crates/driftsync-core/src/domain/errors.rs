//! Domain error types
//!
//! Raised by newtype constructors, path mapping and the daemon status
//! transition table.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid remote path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid hash format (expected 64 hex characters)
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid remote revision
    #[error("Invalid revision: {0}")]
    InvalidRevision(String),

    /// Invalid change cursor
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_names_both_states() {
        let err = DomainError::InvalidState {
            from: "paused".to_string(),
            to: "starting".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid state transition from paused to starting");
    }

    #[test]
    fn test_errors_carry_the_offending_value() {
        assert_eq!(
            DomainError::InvalidCursor(String::new()).to_string(),
            "Invalid cursor: "
        );
        assert_eq!(
            DomainError::PathNotInSyncRoot("/etc/passwd".into()),
            DomainError::PathNotInSyncRoot("/etc/passwd".into())
        );
        assert_ne!(
            DomainError::InvalidRevision("r1".into()),
            DomainError::InvalidHash("r1".into())
        );
    }
}
