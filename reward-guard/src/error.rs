//! Error types for the reward guard

use chrono::{DateTime, Utc};
use ledger_core::LedgerError;
use thiserror::Error;

/// Reward guard error
#[derive(Debug, Error)]
pub enum GuardError {
    /// One-time reward already granted, or a racing claim won
    #[error("Reward already claimed: {0}")]
    AlreadyClaimed(String),

    /// Cooldown still running
    #[error("Reward not available until {next_available_at}")]
    TooEarly {
        /// Earliest instant the claim is allowed again
        next_available_at: DateTime<Utc>,
    },

    /// User does not meet the reward requirement
    #[error("Not eligible: {0}")]
    NotEligible(String),

    /// Malformed claim
    #[error("Validation error: {0}")]
    Validation(String),

    /// Ledger failure while reading history or applying the reward
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GuardError {
    /// Stable reason code for API responses
    pub fn reason_code(&self) -> &'static str {
        match self {
            GuardError::AlreadyClaimed(_) => "already_claimed",
            GuardError::TooEarly { .. } => "too_early",
            GuardError::NotEligible(_) => "not_eligible",
            GuardError::Validation(_) => "validation_error",
            GuardError::Ledger(e) => e.reason_code(),
            GuardError::InvalidConfig(_) => "internal_error",
        }
    }

    /// When the rejected claim becomes possible, if known
    pub fn next_available_at(&self) -> Option<DateTime<Utc>> {
        match self {
            GuardError::TooEarly { next_available_at } => Some(*next_available_at),
            _ => None,
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, GuardError>;
