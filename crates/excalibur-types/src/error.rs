//! Error types for Excalibur
//!
//! All errors are explicit. Every variant maps to a stable error code, and
//! retriability is a property of the error kind, not of call sites.

use thiserror::Error;

/// Result type for Excalibur operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Excalibur error taxonomy
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    // ========================================================================
    // Argument Errors
    // ========================================================================

    /// Null, empty, or out-of-range argument
    #[error("Invalid argument {argument}: {reason}")]
    ArgumentInvalid { argument: String, reason: String },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================

    /// No handler registered for the message type
    #[error("No {expected_shape} handler registered for message type {message_type}")]
    NoHandler {
        message_type: String,
        expected_shape: String,
    },

    /// Middleware applicability evaluation failed
    #[error("Applicability evaluation failed for middleware {middleware}: {reason}")]
    MiddlewareFilter { middleware: String, reason: String },

    // ========================================================================
    // Saga Errors
    // ========================================================================

    /// A saga predicate threw during evaluation
    #[error("Condition evaluation failed at step {step}: {reason}")]
    ConditionEval { step: String, reason: String },

    /// Optimistic concurrency conflict on saga state
    #[error("Concurrency conflict on saga {saga_id}: expected version {expected_version}, found {actual_version}")]
    ConcurrencyConflict {
        saga_id: String,
        expected_version: u64,
        actual_version: u64,
    },

    /// Saga instance not found
    #[error("Saga {saga_id} not found")]
    SagaNotFound { saga_id: String },

    // ========================================================================
    // Network Errors
    // ========================================================================

    /// Retryable network failure (connection errors, 5xx, 408, 429)
    #[error("Transient network error: {reason}")]
    TransientNetwork {
        reason: String,
        status_code: Option<u16>,
    },

    /// Non-retryable network failure
    #[error("Permanent network error: {reason}")]
    PermanentNetwork {
        reason: String,
        status_code: Option<u16>,
    },

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// The host cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Compliance Errors
    // ========================================================================

    /// Audit hash chain mismatch (detection only)
    #[error("Audit integrity violation at event {event_id}: {description}")]
    IntegrityViolation {
        event_id: String,
        description: String,
    },

    /// Read denied by the audit access policy
    #[error("Audit access denied for role {role}: {operation}")]
    AuditAccessDenied { role: String, operation: String },

    // ========================================================================
    // Key Management Errors
    // ========================================================================

    /// Key not found in the provider
    #[error("Key {key_id} not found")]
    KeyNotFound { key_id: String },

    /// Key exists but its status forbids the operation
    #[error("Key {key_id} is {status} and cannot {operation}")]
    KeyStateInvalid {
        key_id: String,
        status: String,
        operation: String,
    },

    /// A single item failed during batch migration
    #[error("Migration of item {item_id} failed: {reason}")]
    MigrationItemFailed { item_id: String, reason: String },

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Payload could not be serialized or deserialized
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DispatchError {
    /// Create an argument-invalid error
    pub fn argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ArgumentInvalid {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    /// Create a no-handler error naming the expected shape
    pub fn no_handler(message_type: impl Into<String>, expected_shape: impl Into<String>) -> Self {
        Self::NoHandler {
            message_type: message_type.into(),
            expected_shape: expected_shape.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Check if this is a retriable error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::ConcurrencyConflict { .. }
        )
    }

    /// Check if this error represents host cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get a stable error code for logs and API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ArgumentInvalid { .. } => "ARGUMENT_INVALID",
            Self::NoHandler { .. } => "NO_HANDLER",
            Self::MiddlewareFilter { .. } => "MIDDLEWARE_FILTER_ERROR",
            Self::ConditionEval { .. } => "CONDITION_EVAL_ERROR",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::SagaNotFound { .. } => "SAGA_NOT_FOUND",
            Self::TransientNetwork { .. } => "TRANSIENT_NETWORK",
            Self::PermanentNetwork { .. } => "PERMANENT_NETWORK",
            Self::Cancelled => "CANCELLED",
            Self::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            Self::AuditAccessDenied { .. } => "AUDIT_ACCESS_DENIED",
            Self::KeyNotFound { .. } => "KEY_NOT_FOUND",
            Self::KeyStateInvalid { .. } => "KEY_STATE_INVALID",
            Self::MigrationItemFailed { .. } => "MIGRATION_ITEM_FAILED",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = DispatchError::no_handler("TestAction", "action");
        assert_eq!(err.error_code(), "NO_HANDLER");
        assert_eq!(DispatchError::Cancelled.error_code(), "CANCELLED");
    }

    #[test]
    fn test_retriable_errors() {
        let transient = DispatchError::TransientNetwork {
            reason: "503".to_string(),
            status_code: Some(503),
        };
        assert!(transient.is_retriable());

        let conflict = DispatchError::ConcurrencyConflict {
            saga_id: "saga_1".to_string(),
            expected_version: 3,
            actual_version: 4,
        };
        assert!(conflict.is_retriable());

        let permanent = DispatchError::PermanentNetwork {
            reason: "403".to_string(),
            status_code: Some(403),
        };
        assert!(!permanent.is_retriable());
        assert!(!DispatchError::Cancelled.is_retriable());
    }

    #[test]
    fn test_no_handler_names_shape_and_type() {
        let err = DispatchError::no_handler("orders::SubmitOrderCommand", "action");
        let message = err.to_string();
        assert!(message.contains("action"));
        assert!(message.contains("orders::SubmitOrderCommand"));
    }
}
