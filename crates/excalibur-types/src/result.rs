//! The uniform result flowing back through the middleware chain

use serde::Serialize;

use crate::error::DispatchError;

/// Outcome of a dispatch, observed by every middleware on the return path
///
/// Handler return values are erased to JSON so middleware stays
/// message-type agnostic.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    /// Whether the dispatch succeeded
    pub success: bool,
    /// The handler's return value, when any
    pub return_value: Option<serde_json::Value>,
    /// The failure, when the dispatch did not succeed
    pub error: Option<DispatchError>,
}

impl DispatchResult {
    /// A successful dispatch with no return value
    pub fn ok_empty() -> Self {
        Self {
            success: true,
            return_value: None,
            error: None,
        }
    }

    /// A successful dispatch carrying a value
    pub fn ok(value: impl Serialize) -> Self {
        Self {
            success: true,
            return_value: serde_json::to_value(value).ok(),
            error: None,
        }
    }

    /// A failed dispatch
    pub fn failed(error: DispatchError) -> Self {
        Self {
            success: false,
            return_value: None,
            error: Some(error),
        }
    }

    /// The return value as a string, when it is one
    pub fn return_value_str(&self) -> Option<&str> {
        self.return_value.as_ref().and_then(|value| value.as_str())
    }

    /// Convert into a `Result`, surfacing the error
    pub fn into_result(self) -> crate::error::Result<Option<serde_json::Value>> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.return_value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_carries_value() {
        let result = DispatchResult::ok("Handled");
        assert!(result.success);
        assert_eq!(result.return_value_str(), Some("Handled"));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_failed_carries_error() {
        let result = DispatchResult::failed(DispatchError::Cancelled);
        assert!(!result.success);
        assert!(result.into_result().is_err());
    }
}
