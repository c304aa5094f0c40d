//! Raffle domain types

use chrono::{DateTime, Utc};
use ledger_core::{Currency, TransactionId, TransactionResult, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Raffle identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaffleId(String);

impl RaffleId {
    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered id (UUIDv7)
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RaffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raffle lifecycle status
///
/// `Finalizing` and `Cancelling` are held under a lease while payouts or
/// refunds run. A lease that expires without reaching a terminal status can
/// be taken over, which resumes the interrupted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaffleStatus {
    /// Accepting entries
    Active,
    /// Winners being drawn and paid
    Finalizing,
    /// Entries being refunded
    Cancelling,
    /// Winners paid (terminal)
    Completed,
    /// Entries refunded (terminal)
    Cancelled,
}

impl RaffleStatus {
    /// Completed or Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaffleStatus::Completed | RaffleStatus::Cancelled)
    }

    /// Held under a settlement lease
    pub fn is_transitional(&self) -> bool {
        matches!(self, RaffleStatus::Finalizing | RaffleStatus::Cancelling)
    }
}

impl fmt::Display for RaffleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaffleStatus::Active => "active",
            RaffleStatus::Finalizing => "finalizing",
            RaffleStatus::Cancelling => "cancelling",
            RaffleStatus::Completed => "completed",
            RaffleStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Exclusive right to settle a raffle until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLease {
    /// Token of the settling worker
    pub holder: String,
    /// Lease end; `None` once released
    pub expires_at: Option<DateTime<Utc>>,
}

impl SettlementLease {
    /// Whether another worker may take the lease over at `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at <= now)
    }
}

/// A raffle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raffle {
    /// Raffle id
    pub id: RaffleId,

    /// Display title
    pub title: String,

    /// Fee per entry
    pub entry_fee: Decimal,

    /// Currency the fee is charged in
    pub entry_currency: Currency,

    /// Total prize fund
    pub prize_amount: Decimal,

    /// Currency prizes are paid in
    pub prize_currency: Currency,

    /// Entries accepted from
    pub start_time: DateTime<Utc>,

    /// Entries accepted until (exclusive)
    pub end_time: DateTime<Utc>,

    /// Places paid
    pub winners_count: u32,

    /// Lifecycle status
    pub status: RaffleStatus,

    /// Distinct participants
    pub participants_count: u32,

    /// Entries across all participants
    pub total_entries: u64,

    /// Operator-supplied prize per place (empty = computed at finalization)
    pub prize_distribution: BTreeMap<u32, Decimal>,

    /// Settlement lease while Finalizing or Cancelling
    pub lease: Option<SettlementLease>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// When the raffle reached a terminal status
    pub settled_at: Option<DateTime<Utc>>,
}

/// Operator request to create a raffle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRaffle {
    /// Display title
    pub title: String,

    /// Fee per entry
    pub entry_fee: Decimal,

    /// Currency the fee is charged in
    pub entry_currency: Currency,

    /// Total prize fund
    pub prize_amount: Decimal,

    /// Currency prizes are paid in
    pub prize_currency: Currency,

    /// Entries accepted from
    pub start_time: DateTime<Utc>,

    /// Entries accepted until (exclusive)
    pub end_time: DateTime<Utc>,

    /// Places paid
    pub winners_count: u32,

    /// Explicit prize per place
    pub prize_distribution: Option<BTreeMap<u32, Decimal>>,
}

impl NewRaffle {
    /// Ticket-fee raffle paying `prize_amount` WINIX over `winners_count` places
    pub fn new(
        title: impl Into<String>,
        entry_fee: Decimal,
        prize_amount: Decimal,
        winners_count: u32,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            title: title.into(),
            entry_fee,
            entry_currency: Currency::Tickets,
            prize_amount,
            prize_currency: Currency::Winix,
            start_time,
            end_time,
            winners_count,
            prize_distribution: None,
        }
    }

    /// Charge the fee in `currency`
    pub fn with_entry_currency(mut self, currency: Currency) -> Self {
        self.entry_currency = currency;
        self
    }

    /// Pay prizes in `currency`
    pub fn with_prize_currency(mut self, currency: Currency) -> Self {
        self.prize_currency = currency;
        self
    }

    /// Use an explicit prize per place
    pub fn with_distribution(mut self, distribution: BTreeMap<u32, Decimal>) -> Self {
        self.prize_distribution = Some(distribution);
        self
    }
}

/// Participation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipationStatus {
    /// Entered; after finalization, participated without winning
    Active,
    /// Drew a place
    Won,
    /// Fee returned on cancellation
    Refunded,
}

impl ParticipationStatus {
    /// Display code
    pub fn code(&self) -> &'static str {
        match self {
            ParticipationStatus::Active => "participated",
            ParticipationStatus::Won => "won",
            ParticipationStatus::Refunded => "refunded",
        }
    }
}

/// A user's entry into a raffle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participation {
    /// Raffle entered
    pub raffle_id: RaffleId,

    /// Entrant
    pub user_id: UserId,

    /// Entries held (draw weight)
    pub entry_count: u32,

    /// Status
    pub status: ParticipationStatus,

    /// Fee transactions already counted into `entry_count`
    pub fee_transactions: Vec<TransactionId>,

    /// First entry
    pub joined_at: DateTime<Utc>,

    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// A drawn place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    /// Raffle
    pub raffle_id: RaffleId,

    /// Winner
    pub user_id: UserId,

    /// Place, 1-based
    pub place: u32,

    /// Prize for this place
    pub prize_amount: Decimal,

    /// Prize currency
    pub prize_currency: Currency,

    /// Ledger id of the payout
    pub payout_transaction_id: TransactionId,

    /// Payout credited
    pub reward_claimed: bool,

    /// Winner has been notified
    pub notified: bool,

    /// Draw time
    pub created_at: DateTime<Utc>,
}

/// Result of a successful participation
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipationOutcome {
    /// Raffle entered
    pub raffle_id: RaffleId,

    /// Entrant
    pub user_id: UserId,

    /// Entries bought by this call
    pub entries_added: u32,

    /// Entries the user now holds
    pub total_entries: u32,

    /// First entry of this user into this raffle
    pub new_participant: bool,

    /// Ledger result of the fee debit
    pub fee: TransactionResult,
}

/// Result of a finalization
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizationOutcome {
    /// Raffle finalized
    pub raffle_id: RaffleId,

    /// Winners by place
    pub winners: Vec<WinnerRecord>,

    /// Participants in the draw
    pub participants: usize,

    /// Entries in the draw
    pub total_entries: u64,

    /// Another call had already finished the raffle
    pub already_completed: bool,
}

/// Result of a cancellation
#[derive(Debug, Clone, PartialEq)]
pub struct CancellationOutcome {
    /// Raffle cancelled
    pub raffle_id: RaffleId,

    /// Participations refunded
    pub refunded: usize,

    /// Another call had already cancelled the raffle
    pub already_cancelled: bool,
}

/// Result of [`crate::RaffleEngine::finalize_expired`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementReport {
    /// Raffles examined
    pub scanned: usize,
    /// Raffles finalized
    pub finalized: usize,
    /// Interrupted cancellations finished
    pub cancelled: usize,
    /// Raffles left active without entries
    pub no_participants: usize,
    /// Raffles held by another worker
    pub contended: usize,
    /// Raffles that failed and stay pending
    pub failed: usize,
}
