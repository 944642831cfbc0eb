//! Error taxonomy for the sequential-thinking engine.
//!
//! The five-way split mirrors the response payload's `error` tag: callers at
//! the pipeline boundary match on `kind()` to decide which counter to bump
//! and what to put in the response, nothing upstream needs the `Display`
//! text to be stable.

use thiserror::Error;

/// Tag used in the response payload and for metrics bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    BusinessLogic,
    Security,
    Tree,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::BusinessLogic => "BUSINESS_LOGIC_ERROR",
            ErrorKind::Security => "SECURITY_ERROR",
            ErrorKind::Tree => "TREE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether an error of this kind is *usually* counted toward
    /// `failedRequests`. Validation and business-logic failures are always
    /// rejected before a session critical section is entered, so they never
    /// count. The other kinds are counted when they occur inside the
    /// critical section — the pipeline is the source of truth for exactly
    /// where that boundary is, this is a convenience for callers that don't
    /// need that precision.
    pub fn counts_as_failed_request(self) -> bool {
        !matches!(self, ErrorKind::Validation | ErrorKind::BusinessLogic)
    }
}

#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn business_logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessLogic, message)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message)
    }

    pub fn tree(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tree, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_business_logic_are_not_failed_requests() {
        assert!(!ErrorKind::Validation.counts_as_failed_request());
        assert!(!ErrorKind::BusinessLogic.counts_as_failed_request());
        assert!(ErrorKind::Security.counts_as_failed_request());
        assert!(ErrorKind::Tree.counts_as_failed_request());
        assert!(ErrorKind::Internal.counts_as_failed_request());
    }

    #[test]
    fn as_str_matches_response_tags() {
        assert_eq!(ErrorKind::Validation.as_str(), "VALIDATION_ERROR");
        assert_eq!(ErrorKind::Security.as_str(), "SECURITY_ERROR");
        assert_eq!(EngineError::tree("missing node").kind, ErrorKind::Tree);
    }
}
