//! Error types for the raffle engine

use crate::types::{RaffleId, RaffleStatus};
use chrono::{DateTime, Utc};
use ledger_core::{LedgerError, StoreError, TransactionId};
use thiserror::Error;

/// Result type for raffle operations
pub type Result<T> = std::result::Result<T, RaffleError>;

/// Raffle errors
#[derive(Error, Debug)]
pub enum RaffleError {
    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// No raffle with this id
    #[error("Raffle not found: {0}")]
    RaffleNotFound(RaffleId),

    /// Entry attempted at or after the end time
    #[error("Raffle {raffle_id} ended at {end_time}")]
    RaffleAlreadyEnded {
        /// Raffle
        raffle_id: RaffleId,
        /// End time
        end_time: DateTime<Utc>,
    },

    /// Entry attempted before the start time
    #[error("Raffle {raffle_id} starts at {start_time}")]
    RaffleNotStarted {
        /// Raffle
        raffle_id: RaffleId,
        /// Start time
        start_time: DateTime<Utc>,
    },

    /// Finalization attempted before the end time
    #[error("Raffle {raffle_id} runs until {end_time}")]
    RaffleNotEnded {
        /// Raffle
        raffle_id: RaffleId,
        /// End time
        end_time: DateTime<Utc>,
    },

    /// Nobody entered; the raffle stays active
    #[error("Raffle {0} has no participants")]
    NoParticipants(RaffleId),

    /// Operation not allowed in the raffle's current status
    #[error("Raffle {raffle_id} is {status}")]
    InvalidRaffleState {
        /// Raffle
        raffle_id: RaffleId,
        /// Status found
        status: RaffleStatus,
    },

    /// Another worker holds the settlement lease
    #[error("Raffle {0} is being settled by another worker")]
    ConcurrencyConflict(RaffleId),

    /// The fee of this request was refunded; the entry does not count
    #[error("Entry fee {0} was refunded")]
    EntryCompensated(TransactionId),

    /// Ledger failure (insufficient funds, unavailable store, ...)
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Non-transient raffle store failure
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Raffle store unavailable after retries
    #[error("Raffle store unavailable after {attempts} attempts: {last_error}")]
    StoreUnavailable {
        /// Attempts made
        attempts: u32,
        /// Last transient error seen
        last_error: StoreError,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RaffleError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RaffleError::Ledger(e) => e.is_retryable(),
            RaffleError::StoreUnavailable { .. } | RaffleError::ConcurrencyConflict(_) => true,
            _ => false,
        }
    }

    /// Stable reason code for API responses
    pub fn reason_code(&self) -> &'static str {
        match self {
            RaffleError::Validation(_) => "validation_error",
            RaffleError::RaffleNotFound(_) => "raffle_not_found",
            RaffleError::RaffleAlreadyEnded { .. } => "raffle_ended",
            RaffleError::RaffleNotStarted { .. } => "raffle_not_started",
            RaffleError::RaffleNotEnded { .. } => "raffle_not_ended",
            RaffleError::NoParticipants(_) => "no_participants",
            RaffleError::InvalidRaffleState { .. } => "invalid_raffle_state",
            RaffleError::ConcurrencyConflict(_) => "try_again",
            RaffleError::EntryCompensated(_) => "entry_refunded",
            RaffleError::Ledger(e) => e.reason_code(),
            RaffleError::Store(_) => "internal_error",
            RaffleError::StoreUnavailable { .. } => "try_again",
            RaffleError::Config(_) => "internal_error",
        }
    }
}

impl From<StoreError> for RaffleError {
    fn from(err: StoreError) -> Self {
        RaffleError::Store(err)
    }
}
