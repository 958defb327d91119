//! Core error types for TRIALFLOW.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding {
        /// What the decoder rejected
        reason: String,
    },

    /// Invalid ID format
    #[error("Invalid ID: {reason}")]
    InvalidId {
        /// Why the id was rejected
        reason: String,
    },

    /// Invalid version
    #[error("Invalid version: {reason}")]
    InvalidVersion {
        /// Why the version was rejected
        reason: String,
    },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Field or structure being validated
        field: String,
        /// Failure description
        reason: String,
    },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity
        kind: String,
        /// Missing identifier
        id: String,
    },

    /// Already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Kind of entity
        kind: String,
        /// Duplicate identifier
        id: String,
    },

    /// Operation is not valid in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: String,
        /// State the component was in
        state: String,
    },

    /// I/O failure
    #[error("I/O error: {reason}")]
    Io {
        /// Underlying error text
        reason: String,
    },

    /// Cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound {
            kind: "Node".to_string(),
            id: "stimulus-3".to_string(),
        };
        assert_eq!(format!("{}", err), "Node not found: stimulus-3");

        let err = CoreError::InvalidState {
            operation: "start".to_string(),
            state: "running".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot start while running");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<u64>("not a number").unwrap_err();
        let err: CoreError = json_err.into();
        assert!(matches!(err, CoreError::InvalidEncoding { .. }));
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(CoreError::Cancelled, CoreError::Cancelled);
        assert_ne!(
            CoreError::Cancelled,
            CoreError::Internal {
                message: "x".to_string()
            }
        );
    }
}
