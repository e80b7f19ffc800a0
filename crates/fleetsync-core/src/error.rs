//! Core error types for fleetsync-core

use thiserror::Error;

/// Errors that can occur in engine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed request or destination
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown correlation id
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind
        kind: &'static str,
        /// Requested id
        id: String,
    },

    /// Registry creation or transition failure
    #[error("{0}")]
    Conflict(String),

    /// Lifecycle operation not applicable to this entity kind
    #[error("{operation} is not supported for {kind}")]
    Unsupported {
        /// Entity kind
        kind: &'static str,
        /// Lifecycle operation
        operation: &'static str,
    },

    /// Document store failure
    #[error("store error: {0}")]
    Store(String),

    /// Message bus failure
    #[error("bus error: {0}")]
    Bus(String),

    /// Host inventory query failed
    #[error("inventory query failed: {0}")]
    Inventory(String),

    /// Notification callback failed
    #[error("notification failed: {0}")]
    Notify(String),

    /// Operation timed out
    #[error("operation timeout")]
    Timeout,

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// HTTP status equivalent of this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Unsupported { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Bus(_) | Self::Notify(_) => 502,
            Self::Timeout => 504,
            Self::Conflict(_)
            | Self::Store(_)
            | Self::Inventory(_)
            | Self::ActorError(_)
            | Self::ConfigError(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CoreError::Validation("x".into()).status_code(), 400);
        assert_eq!(CoreError::not_found("transfer", "abc").status_code(), 404);
        assert_eq!(
            CoreError::Conflict("create transfer error".into()).status_code(),
            500
        );
        assert_eq!(
            CoreError::Unsupported {
                kind: "transfer",
                operation: "delete"
            }
            .status_code(),
            400
        );
        assert_eq!(CoreError::Timeout.status_code(), 504);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            CoreError::not_found("transaction", "abc").to_string(),
            "transaction not found: abc"
        );
        assert_eq!(
            CoreError::Unsupported {
                kind: "task",
                operation: "archive"
            }
            .to_string(),
            "archive is not supported for task"
        );
    }
}
