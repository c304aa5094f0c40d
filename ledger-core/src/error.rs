//! Error types for the ledger

use crate::types::{Currency, TransactionId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Ledger errors
///
/// Everything except [`LedgerError::StoreUnavailable`] is fail-closed: the
/// balance was not touched and repeating the call gives the same answer.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Debit would take a balance below zero
    #[error("Insufficient {currency}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Currency that would go negative
        currency: Currency,
        /// Holding at evaluation time
        available: Decimal,
        /// Amount the debit asked for
        requested: Decimal,
    },

    /// User does not exist
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Id reused for a different intent
    #[error("Transaction {0} already exists with a different payload")]
    IdempotencyMismatch(TransactionId),

    /// Transient store failure outlasted the retry budget
    #[error("Store unavailable after {attempts} attempts: {last_error}")]
    StoreUnavailable {
        /// Attempts made
        attempts: u32,
        /// Last transient error seen
        last_error: StoreError,
    },

    /// Non-transient store failure
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StoreUnavailable { .. })
    }

    /// Stable reason code for API responses
    pub fn reason_code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::UserNotFound(_) => "user_not_found",
            LedgerError::IdempotencyMismatch(_) => "validation_error",
            LedgerError::StoreUnavailable { .. } => "try_again",
            LedgerError::Store(_) => "internal_error",
            LedgerError::Config(_) => "internal_error",
            LedgerError::Io(_) => "internal_error",
        }
    }
}

/// Errors raised by a [`crate::storage::LedgerStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Call did not finish in time; outcome unknown
    #[error("Store timeout: {0}")]
    Timeout(String),

    /// Conditional write lost against a concurrent writer
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Backend temporarily unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend reported a permanent failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Timeouts, conflicts and outages are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Conflict(_) | StoreError::Unavailable(_)
        )
    }

    /// Lost a conditional write
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::TimedOut => StoreError::Timeout(err.to_string()),
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Timeout("t".into()).is_transient());
        assert!(StoreError::Conflict("c".into()).is_transient());
        assert!(StoreError::Unavailable("u".into()).is_transient());
        assert!(!StoreError::Serialization("s".into()).is_transient());
        assert!(!StoreError::Backend("b".into()).is_transient());
    }

    #[test]
    fn test_reason_codes() {
        let err = LedgerError::InsufficientFunds {
            currency: Currency::Tickets,
            available: Decimal::from(1),
            requested: Decimal::from(2),
        };
        assert_eq!(err.reason_code(), "insufficient_funds");
        assert!(!err.is_retryable());

        let err = LedgerError::StoreUnavailable {
            attempts: 4,
            last_error: StoreError::Timeout("slow".into()),
        };
        assert_eq!(err.reason_code(), "try_again");
        assert!(err.is_retryable());
    }
}
