//! Store error taxonomy: transient vs permanent.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error from a store call.
///
/// Callers decide on retry by classification: transient errors are worth
/// retrying with backoff, constraint violations are reported per-item in
/// batch operations, and permanent errors are surfaced as-is.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// Network/timeout style failure; the same call may succeed if retried.
    #[error("transient store error: {0}")]
    Transient(String),

    /// A uniqueness or schema constraint was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Anything the caller cannot fix by retrying (bad filter field,
    /// malformed document, unsupported operation).
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether a retry with backoff can be expected to help.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

impl From<StoreError> for leadline_core::DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Constraint(msg) => leadline_core::DomainError::conflict(msg),
            other => leadline_core::DomainError::store(other.to_string()),
        }
    }
}
