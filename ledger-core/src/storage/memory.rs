//! In-memory ledger store
//!
//! All rows live behind one mutex, so every call is trivially atomic. Fault
//! injection ([`MemoryStore::fail_next`], [`MemoryStore::lose_next_commit_acks`],
//! [`MemoryStore::set_latency`]) lets tests drive the retry and
//! unknown-outcome paths of the ledger.

use super::{newest_first, Commit, LedgerStore, VersionedBalance};
use crate::error::{StoreError, StoreResult};
use crate::types::{HistoryFilter, TransactionId, TransactionRecord, TransactionStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Store operation, for targeting injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// [`LedgerStore::load_balance`]
    LoadBalance,
    /// [`LedgerStore::load_transaction`]
    LoadTransaction,
    /// [`LedgerStore::insert_transaction`]
    InsertTransaction,
    /// [`LedgerStore::commit`]
    Commit,
    /// History and pending scans
    Query,
    /// Every operation
    Any,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    remaining: usize,
    error: StoreError,
}

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<UserId, VersionedBalance>,
    transactions: HashMap<TransactionId, (u64, TransactionRecord)>,
    by_user: HashMap<UserId, Vec<TransactionId>>,
    next_seq: u64,
}

/// Process-local [`LedgerStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: Mutex<Vec<Fault>>,
    lost_acks: Mutex<usize>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error`
    pub fn fail_next(&self, op: StoreOp, times: usize, error: StoreError) {
        self.faults.lock().push(Fault {
            op,
            remaining: times,
            error,
        });
    }

    /// Apply the next `times` commits but report them as timed out
    pub fn lose_next_commit_acks(&self, times: usize) {
        *self.lost_acks.lock() += times;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of stored transaction rows
    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    async fn before(&self, op: StoreOp) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        if let Some(fault) = faults
            .iter_mut()
            .find(|f| f.remaining > 0 && (f.op == op || f.op == StoreOp::Any))
        {
            fault.remaining -= 1;
            let error = fault.error.clone();
            faults.retain(|f| f.remaining > 0);
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load_balance(&self, user_id: &UserId) -> StoreResult<VersionedBalance> {
        self.before(StoreOp::LoadBalance).await?;
        let state = self.state.lock();
        Ok(state.balances.get(user_id).copied().unwrap_or_default())
    }

    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<TransactionRecord>> {
        self.before(StoreOp::LoadTransaction).await?;
        let state = self.state.lock();
        Ok(state.transactions.get(id).map(|(_, record)| record.clone()))
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> StoreResult<TransactionRecord> {
        self.before(StoreOp::InsertTransaction).await?;
        let mut state = self.state.lock();

        if let Some((_, existing)) = state.transactions.get(&record.id) {
            return Ok(existing.clone());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .transactions
            .insert(record.id.clone(), (seq, record.clone()));
        state
            .by_user
            .entry(record.user_id.clone())
            .or_default()
            .push(record.id.clone());

        Ok(record.clone())
    }

    async fn commit(&self, commit: &Commit) -> StoreResult<()> {
        self.before(StoreOp::Commit).await?;

        {
            let mut state = self.state.lock();
            let record = &commit.transaction;

            let stored_status = state
                .transactions
                .get(&record.id)
                .map(|(_, r)| r.status)
                .ok_or_else(|| {
                    StoreError::Backend(format!("transaction {} was never inserted", record.id))
                })?;
            if stored_status != TransactionStatus::Pending {
                return Err(StoreError::Conflict(format!(
                    "transaction {} is already {:?}",
                    record.id, stored_status
                )));
            }

            let current = state
                .balances
                .get(&record.user_id)
                .copied()
                .unwrap_or_default();
            if current.version != commit.expected_version {
                return Err(StoreError::Conflict(format!(
                    "balance of {} moved from version {} to {}",
                    record.user_id, commit.expected_version, current.version
                )));
            }

            if let Some(balance) = commit.new_balance {
                state.balances.insert(
                    record.user_id.clone(),
                    VersionedBalance {
                        balance,
                        version: current.version + 1,
                    },
                );
            }
            if let Some(slot) = state.transactions.get_mut(&record.id) {
                slot.1 = record.clone();
            }
        }

        let mut lost_acks = self.lost_acks.lock();
        if *lost_acks > 0 {
            *lost_acks -= 1;
            return Err(StoreError::Timeout("commit acknowledgement lost".to_string()));
        }
        Ok(())
    }

    async fn user_transactions(
        &self,
        user_id: &UserId,
        filter: &HistoryFilter,
    ) -> StoreResult<Vec<TransactionRecord>> {
        self.before(StoreOp::Query).await?;
        let state = self.state.lock();

        let records = state
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.transactions.get(id))
                    .filter(|(_, record)| filter.matches(record))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(newest_first(records, filter))
    }

    async fn pending_transactions(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>> {
        self.before(StoreOp::Query).await?;
        let state = self.state.lock();

        let mut pending: Vec<&(u64, TransactionRecord)> = state
            .transactions
            .values()
            .filter(|(_, r)| r.status == TransactionStatus::Pending && r.created_at < created_before)
            .collect();
        pending.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then_with(|| seq_a.cmp(seq_b))
        });

        Ok(pending
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Balance, Delta, TransactionKind};

    fn record(id: &str) -> TransactionRecord {
        TransactionRecord::new(
            TransactionId::new(id),
            UserId::new("u1"),
            TransactionKind::TaskReward,
            Delta::tickets(3),
        )
    }

    #[tokio::test]
    async fn test_insert_is_insert_if_absent() {
        let store = MemoryStore::new();
        let first = record("t1").with_metadata("attempt", "1");
        let second = record("t1").with_metadata("attempt", "2");

        store.insert_transaction(&first).await.unwrap();
        let stored = store.insert_transaction(&second).await.unwrap();

        assert_eq!(stored.metadata.get("attempt").map(String::as_str), Some("1"));
        assert_eq!(store.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_checks_version_and_status() {
        let store = MemoryStore::new();
        let pending = record("t1");
        store.insert_transaction(&pending).await.unwrap();

        let balance = Balance {
            tickets: 3,
            ..Balance::zero()
        };
        let done = pending.completed(balance, Utc::now());

        let stale = Commit {
            transaction: done.clone(),
            expected_version: 7,
            new_balance: Some(balance),
        };
        assert!(store.commit(&stale).await.unwrap_err().is_conflict());

        let fresh = Commit {
            expected_version: 0,
            ..stale
        };
        store.commit(&fresh).await.unwrap();
        assert_eq!(store.load_balance(&UserId::new("u1")).await.unwrap().version, 1);

        // Second commit of the same record loses on status
        let again = Commit {
            expected_version: 1,
            ..fresh
        };
        assert!(store.commit(&again).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::LoadBalance, 2, StoreError::Unavailable("down".into()));

        let user = UserId::new("u1");
        assert!(store.load_balance(&user).await.is_err());
        assert!(store.load_balance(&user).await.is_err());
        assert!(store.load_balance(&user).await.is_ok());
    }
}
