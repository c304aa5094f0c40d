//! Storage layer for raffles, participations and winners
//!
//! Every mutating call is a single conditional step the store applies
//! atomically. Each one is safe to repeat after an unknown outcome:
//!
//! - [`RaffleStore::change_status`] succeeds again for the lease holder
//! - [`RaffleStore::register_entry`] is keyed by the fee transaction id
//! - [`RaffleStore::insert_winners`] keeps the first winner set written
//!
//! Implementations:
//!
//! - [`MemoryRaffleStore`] - process-local, with fault injection for tests
//! - [`RocksRaffleStore`] - RocksDB column families

mod memory;
mod rocks;

pub use memory::{MemoryRaffleStore, RaffleOp};
pub use rocks::RocksRaffleStore;

use crate::types::{
    Participation, ParticipationStatus, Raffle, RaffleId, RaffleStatus, SettlementLease,
    WinnerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_core::{StoreResult, TransactionId, UserId};

/// Conditional status update
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Statuses the raffle may be in
    pub expected: Vec<RaffleStatus>,

    /// Status to move to
    pub next: RaffleStatus,

    /// Token of the calling worker
    pub holder: String,

    /// Lease to hold when `next` is transitional; `None` releases it
    pub lease_until: Option<DateTime<Utc>>,

    /// Evaluation time for lease expiry
    pub now: DateTime<Utc>,
}

impl StatusChange {
    /// Whether `raffle` may take this change
    ///
    /// A transitional status only moves for the current lease holder or once
    /// its lease is open.
    pub fn permits(&self, raffle: &Raffle) -> bool {
        if !self.expected.contains(&raffle.status) {
            return false;
        }
        if !raffle.status.is_transitional() {
            return true;
        }
        match &raffle.lease {
            Some(lease) => lease.holder == self.holder || lease.is_open(self.now),
            None => true,
        }
    }

    /// Apply to `raffle` (caller checked [`StatusChange::permits`])
    pub fn apply_to(&self, raffle: &mut Raffle) {
        raffle.status = self.next;
        raffle.lease = if self.next.is_transitional() {
            Some(SettlementLease {
                holder: self.holder.clone(),
                expires_at: self.lease_until,
            })
        } else {
            None
        };
        if self.next.is_terminal() {
            raffle.settled_at = Some(self.now);
        }
    }
}

/// Result of [`RaffleStore::change_status`]
#[derive(Debug, Clone, PartialEq)]
pub enum StatusChangeResult {
    /// Change applied; raffle after the change
    Changed(Raffle),
    /// Condition failed; raffle as found
    Rejected(Raffle),
    /// No such raffle
    NotFound,
}

/// Entry purchase to record
#[derive(Debug, Clone)]
pub struct EntryRegistration {
    /// Raffle
    pub raffle_id: RaffleId,

    /// Entrant
    pub user_id: UserId,

    /// Entries bought
    pub entries: u32,

    /// Fee transaction that paid for them
    pub fee_transaction_id: TransactionId,

    /// Registration time
    pub now: DateTime<Utc>,
}

/// Result of [`RaffleStore::register_entry`]
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Entries added
    Registered {
        /// Participation after the update
        participation: Participation,
        /// First entry of this user
        new_participant: bool,
    },
    /// This fee transaction was already counted
    AlreadyRegistered(Participation),
    /// Raffle no longer accepts entries
    Closed(RaffleStatus),
    /// No such raffle
    NotFound,
}

/// Which winner flag to set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinnerFlag {
    /// Payout credited
    RewardClaimed,
    /// Winner notified
    Notified,
}

/// Filter for raffle listings
#[derive(Debug, Clone, Default)]
pub struct RaffleFilter {
    /// Only these statuses (empty = all)
    pub statuses: Vec<RaffleStatus>,

    /// Only raffles whose end time is at or before this instant
    pub ended_by: Option<DateTime<Utc>>,

    /// Only raffles whose end time is after this instant
    pub ends_after: Option<DateTime<Utc>>,

    /// Maximum number of raffles
    pub limit: Option<usize>,
}

impl RaffleFilter {
    /// Whether `raffle` passes every filter except `limit`
    pub fn matches(&self, raffle: &Raffle) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&raffle.status) {
            return false;
        }
        if self.ended_by.map_or(false, |ended_by| raffle.end_time > ended_by) {
            return false;
        }
        if self.ends_after.map_or(false, |after| raffle.end_time <= after) {
            return false;
        }
        true
    }
}

/// Row-level client for the raffle tables
#[async_trait]
pub trait RaffleStore: Send + Sync {
    /// Insert `raffle` unless its id exists; returns whichever row is stored
    async fn insert_raffle(&self, raffle: &Raffle) -> StoreResult<Raffle>;

    /// Read a raffle
    async fn load_raffle(&self, id: &RaffleId) -> StoreResult<Option<Raffle>>;

    /// Raffles matching `filter`, earliest end time first
    async fn list_raffles(&self, filter: &RaffleFilter) -> StoreResult<Vec<Raffle>>;

    /// Conditionally move a raffle to a new status
    async fn change_status(&self, id: &RaffleId, change: &StatusChange) -> StoreResult<StatusChangeResult>;

    /// Add entries for a paid fee, only while the raffle is Active
    async fn register_entry(&self, registration: &EntryRegistration) -> StoreResult<Registration>;

    /// Read one participation
    async fn load_participation(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
    ) -> StoreResult<Option<Participation>>;

    /// All participations of a raffle, in joining order
    async fn participations(&self, raffle_id: &RaffleId) -> StoreResult<Vec<Participation>>;

    /// Set a participation's status
    async fn set_participation_status(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
        status: ParticipationStatus,
    ) -> StoreResult<()>;

    /// Store the winner set unless one exists; returns whichever set is stored
    async fn insert_winners(
        &self,
        raffle_id: &RaffleId,
        winners: &[WinnerRecord],
    ) -> StoreResult<Vec<WinnerRecord>>;

    /// Winners of a raffle by place
    async fn winners(&self, raffle_id: &RaffleId) -> StoreResult<Vec<WinnerRecord>>;

    /// Set a flag on one winner
    async fn set_winner_flag(
        &self,
        raffle_id: &RaffleId,
        place: u32,
        flag: WinnerFlag,
    ) -> StoreResult<Option<WinnerRecord>>;
}

/// Apply a [`EntryRegistration`] to an existing participation (or create one)
pub(crate) fn merge_entry(
    existing: Option<Participation>,
    registration: &EntryRegistration,
) -> (Participation, bool) {
    match existing {
        Some(mut participation) => {
            participation.entry_count = participation.entry_count.saturating_add(registration.entries);
            participation
                .fee_transactions
                .push(registration.fee_transaction_id.clone());
            participation.updated_at = registration.now;
            (participation, false)
        }
        None => (
            Participation {
                raffle_id: registration.raffle_id.clone(),
                user_id: registration.user_id.clone(),
                entry_count: registration.entries,
                status: ParticipationStatus::Active,
                fee_transactions: vec![registration.fee_transaction_id.clone()],
                joined_at: registration.now,
                updated_at: registration.now,
            },
            true,
        ),
    }
}

/// Set `flag` on `winner`
pub(crate) fn raise_flag(winner: &mut WinnerRecord, flag: WinnerFlag) {
    match flag {
        WinnerFlag::RewardClaimed => winner.reward_claimed = true,
        WinnerFlag::Notified => winner.notified = true,
    }
}
