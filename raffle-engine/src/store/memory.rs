//! In-memory raffle store
//!
//! One mutex over all tables. [`MemoryRaffleStore::fail_next`] injects
//! faults per operation for the retry and compensation paths.

use super::{
    merge_entry, raise_flag, EntryRegistration, RaffleFilter, RaffleStore, Registration,
    StatusChange, StatusChangeResult, WinnerFlag,
};
use crate::types::{
    Participation, ParticipationStatus, Raffle, RaffleId, RaffleStatus, WinnerRecord,
};
use async_trait::async_trait;
use ledger_core::{StoreError, StoreResult, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Raffle store operation, for targeting injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaffleOp {
    /// Raffle row reads, inserts and listings
    Read,
    /// [`RaffleStore::change_status`]
    ChangeStatus,
    /// [`RaffleStore::register_entry`]
    RegisterEntry,
    /// Participation reads and updates
    Participation,
    /// Winner reads and writes
    Winners,
    /// Every operation
    Any,
}

#[derive(Debug)]
struct Fault {
    op: RaffleOp,
    remaining: usize,
    error: StoreError,
    /// Apply the call before failing (lost acknowledgement)
    after_write: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    raffles: HashMap<RaffleId, Raffle>,
    participations: HashMap<RaffleId, Vec<Participation>>,
    winners: HashMap<RaffleId, Vec<WinnerRecord>>,
}

/// Process-local [`RaffleStore`]
#[derive(Debug, Default)]
pub struct MemoryRaffleStore {
    state: Mutex<MemoryState>,
    faults: Mutex<Vec<Fault>>,
}

impl MemoryRaffleStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error`, without writing
    pub fn fail_next(&self, op: RaffleOp, times: usize, error: StoreError) {
        self.faults.lock().push(Fault {
            op,
            remaining: times,
            error,
            after_write: false,
        });
    }

    /// Apply the next `times` calls of `op` but report `error`
    pub fn lose_next_acks(&self, op: RaffleOp, times: usize, error: StoreError) {
        self.faults.lock().push(Fault {
            op,
            remaining: times,
            error,
            after_write: true,
        });
    }

    fn take_fault(&self, op: RaffleOp, after_write: bool) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        if let Some(fault) = faults.iter_mut().find(|f| {
            f.remaining > 0 && f.after_write == after_write && (f.op == op || f.op == RaffleOp::Any)
        }) {
            fault.remaining -= 1;
            let error = fault.error.clone();
            faults.retain(|f| f.remaining > 0);
            return Err(error);
        }
        Ok(())
    }

    fn before(&self, op: RaffleOp) -> StoreResult<()> {
        self.take_fault(op, false)
    }

    fn after(&self, op: RaffleOp) -> StoreResult<()> {
        self.take_fault(op, true)
    }
}

#[async_trait]
impl RaffleStore for MemoryRaffleStore {
    async fn insert_raffle(&self, raffle: &Raffle) -> StoreResult<Raffle> {
        self.before(RaffleOp::Read)?;
        let stored = self
            .state
            .lock()
            .raffles
            .entry(raffle.id.clone())
            .or_insert_with(|| raffle.clone())
            .clone();
        self.after(RaffleOp::Read)?;
        Ok(stored)
    }

    async fn load_raffle(&self, id: &RaffleId) -> StoreResult<Option<Raffle>> {
        self.before(RaffleOp::Read)?;
        Ok(self.state.lock().raffles.get(id).cloned())
    }

    async fn list_raffles(&self, filter: &RaffleFilter) -> StoreResult<Vec<Raffle>> {
        self.before(RaffleOp::Read)?;
        let state = self.state.lock();
        let mut raffles: Vec<Raffle> = state
            .raffles
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        raffles.sort_by(|a, b| a.end_time.cmp(&b.end_time).then_with(|| a.id.cmp(&b.id)));
        raffles.truncate(filter.limit.unwrap_or(raffles.len()));
        Ok(raffles)
    }

    async fn change_status(
        &self,
        id: &RaffleId,
        change: &StatusChange,
    ) -> StoreResult<StatusChangeResult> {
        self.before(RaffleOp::ChangeStatus)?;
        let result = {
            let mut state = self.state.lock();
            match state.raffles.get_mut(id) {
                None => StatusChangeResult::NotFound,
                Some(raffle) if !change.permits(raffle) => {
                    StatusChangeResult::Rejected(raffle.clone())
                }
                Some(raffle) => {
                    change.apply_to(raffle);
                    StatusChangeResult::Changed(raffle.clone())
                }
            }
        };
        self.after(RaffleOp::ChangeStatus)?;
        Ok(result)
    }

    async fn register_entry(&self, registration: &EntryRegistration) -> StoreResult<Registration> {
        self.before(RaffleOp::RegisterEntry)?;
        let result = {
            let mut state = self.state.lock();
            let state = &mut *state;

            match state.raffles.get_mut(&registration.raffle_id) {
                None => Registration::NotFound,
                Some(raffle) => {
                    let rows = state
                        .participations
                        .entry(registration.raffle_id.clone())
                        .or_default();
                    let position = rows.iter().position(|p| p.user_id == registration.user_id);

                    let counted = position
                        .map(|i| &rows[i])
                        .filter(|p| p.fee_transactions.contains(&registration.fee_transaction_id))
                        .cloned();

                    if let Some(existing) = counted {
                        Registration::AlreadyRegistered(existing)
                    } else if raffle.status != RaffleStatus::Active {
                        Registration::Closed(raffle.status)
                    } else {
                        let existing = position.map(|i| rows[i].clone());
                        let (participation, new_participant) = merge_entry(existing, registration);
                        match position {
                            Some(i) => rows[i] = participation.clone(),
                            None => rows.push(participation.clone()),
                        }
                        if new_participant {
                            raffle.participants_count += 1;
                        }
                        raffle.total_entries += u64::from(registration.entries);
                        Registration::Registered {
                            participation,
                            new_participant,
                        }
                    }
                }
            }
        };
        self.after(RaffleOp::RegisterEntry)?;
        Ok(result)
    }

    async fn load_participation(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
    ) -> StoreResult<Option<Participation>> {
        self.before(RaffleOp::Participation)?;
        let state = self.state.lock();
        Ok(state
            .participations
            .get(raffle_id)
            .and_then(|rows| rows.iter().find(|p| &p.user_id == user_id))
            .cloned())
    }

    async fn participations(&self, raffle_id: &RaffleId) -> StoreResult<Vec<Participation>> {
        self.before(RaffleOp::Participation)?;
        let state = self.state.lock();
        Ok(state.participations.get(raffle_id).cloned().unwrap_or_default())
    }

    async fn set_participation_status(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
        status: ParticipationStatus,
    ) -> StoreResult<()> {
        self.before(RaffleOp::Participation)?;
        {
            let mut state = self.state.lock();
            if let Some(row) = state
                .participations
                .get_mut(raffle_id)
                .and_then(|rows| rows.iter_mut().find(|p| &p.user_id == user_id))
            {
                row.status = status;
            }
        }
        self.after(RaffleOp::Participation)
    }

    async fn insert_winners(
        &self,
        raffle_id: &RaffleId,
        winners: &[WinnerRecord],
    ) -> StoreResult<Vec<WinnerRecord>> {
        self.before(RaffleOp::Winners)?;
        let stored = {
            let mut state = self.state.lock();
            state
                .winners
                .entry(raffle_id.clone())
                .or_insert_with(|| winners.to_vec())
                .clone()
        };
        self.after(RaffleOp::Winners)?;
        Ok(stored)
    }

    async fn winners(&self, raffle_id: &RaffleId) -> StoreResult<Vec<WinnerRecord>> {
        self.before(RaffleOp::Winners)?;
        let state = self.state.lock();
        let mut winners = state.winners.get(raffle_id).cloned().unwrap_or_default();
        winners.sort_by_key(|w| w.place);
        Ok(winners)
    }

    async fn set_winner_flag(
        &self,
        raffle_id: &RaffleId,
        place: u32,
        flag: WinnerFlag,
    ) -> StoreResult<Option<WinnerRecord>> {
        self.before(RaffleOp::Winners)?;
        let mut state = self.state.lock();
        Ok(state
            .winners
            .get_mut(raffle_id)
            .and_then(|rows| rows.iter_mut().find(|w| w.place == place))
            .map(|winner| {
                raise_flag(winner, flag);
                winner.clone()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ledger_core::{Currency, TransactionId};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn raffle(id: &str) -> Raffle {
        let now = Utc::now();
        Raffle {
            id: RaffleId::new(id),
            title: "Weekly".into(),
            entry_fee: Decimal::ONE,
            entry_currency: Currency::Tickets,
            prize_amount: Decimal::from(100),
            prize_currency: Currency::Winix,
            start_time: now - Duration::hours(1),
            end_time: now + Duration::hours(1),
            winners_count: 1,
            status: RaffleStatus::Active,
            participants_count: 0,
            total_entries: 0,
            prize_distribution: BTreeMap::new(),
            lease: None,
            created_at: now,
            settled_at: None,
        }
    }

    fn entry(user: &str, fee: &str, entries: u32) -> EntryRegistration {
        EntryRegistration {
            raffle_id: RaffleId::new("r1"),
            user_id: UserId::new(user),
            entries,
            fee_transaction_id: TransactionId::new(fee),
            now: Utc::now(),
        }
    }

    fn finalize_by(holder: &str, lease_secs: i64) -> StatusChange {
        let now = Utc::now();
        StatusChange {
            expected: vec![RaffleStatus::Active, RaffleStatus::Finalizing],
            next: RaffleStatus::Finalizing,
            holder: holder.into(),
            lease_until: Some(now + Duration::seconds(lease_secs)),
            now,
        }
    }

    #[tokio::test]
    async fn test_registration_is_keyed_by_fee() {
        let store = MemoryRaffleStore::new();
        store.insert_raffle(&raffle("r1")).await.unwrap();

        let first = store.register_entry(&entry("a", "fee-1", 3)).await.unwrap();
        assert!(matches!(first, Registration::Registered { new_participant: true, .. }));

        let again = store.register_entry(&entry("a", "fee-1", 3)).await.unwrap();
        assert!(matches!(again, Registration::AlreadyRegistered(_)));

        store.register_entry(&entry("a", "fee-2", 2)).await.unwrap();

        let stored = store.load_raffle(&RaffleId::new("r1")).await.unwrap().unwrap();
        assert_eq!(stored.participants_count, 1);
        assert_eq!(stored.total_entries, 5);
    }

    #[tokio::test]
    async fn test_lease_blocks_other_workers_until_expiry() {
        let store = MemoryRaffleStore::new();
        store.insert_raffle(&raffle("r1")).await.unwrap();
        let id = RaffleId::new("r1");

        let taken = store.change_status(&id, &finalize_by("w1", 60)).await.unwrap();
        assert!(matches!(taken, StatusChangeResult::Changed(_)));

        let other = store.change_status(&id, &finalize_by("w2", 60)).await.unwrap();
        assert!(matches!(other, StatusChangeResult::Rejected(_)));

        // Same holder re-enters
        let resumed = store.change_status(&id, &finalize_by("w1", 60)).await.unwrap();
        assert!(matches!(resumed, StatusChangeResult::Changed(_)));

        // Entries are refused once finalizing
        let late = store.register_entry(&entry("b", "fee-9", 1)).await.unwrap();
        assert_eq!(late, Registration::Closed(RaffleStatus::Finalizing));
    }

    #[tokio::test]
    async fn test_winners_are_written_once() {
        let store = MemoryRaffleStore::new();
        let id = RaffleId::new("r1");
        let winner = |user: &str| WinnerRecord {
            raffle_id: id.clone(),
            user_id: UserId::new(user),
            place: 1,
            prize_amount: Decimal::from(100),
            prize_currency: Currency::Winix,
            payout_transaction_id: TransactionId::new("raffle_payout:r1:1"),
            reward_claimed: false,
            notified: false,
            created_at: Utc::now(),
        };

        store.insert_winners(&id, &[winner("a")]).await.unwrap();
        let kept = store.insert_winners(&id, &[winner("b")]).await.unwrap();
        assert_eq!(kept[0].user_id, UserId::new("a"));
    }

    #[tokio::test]
    async fn test_lost_ack_still_writes() {
        let store = MemoryRaffleStore::new();
        store.insert_raffle(&raffle("r1")).await.unwrap();
        store.lose_next_acks(
            RaffleOp::RegisterEntry,
            1,
            StoreError::Timeout("ack lost".into()),
        );

        assert!(store.register_entry(&entry("a", "fee-1", 2)).await.is_err());
        let row = store
            .load_participation(&RaffleId::new("r1"), &UserId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.entry_count, 2);
    }
}
