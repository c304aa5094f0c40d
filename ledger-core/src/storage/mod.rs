//! Storage layer for balances and transaction records
//!
//! The ledger talks to its store through [`LedgerStore`], a row-level client
//! with three primitives:
//!
//! - read a row (balance with its version, transaction by id)
//! - insert a transaction if its id is absent
//! - commit a conditional multi-row write ([`Commit`])
//!
//! A commit only lands if the transaction row is still PENDING and the
//! balance row still carries the version the caller read. Losing either
//! check yields [`StoreError::Conflict`], which the ledger retries.
//!
//! Implementations:
//!
//! - [`MemoryStore`] - process-local, with fault injection for tests
//! - [`RocksStore`] - RocksDB column families, atomic `WriteBatch` commits

mod memory;
mod rocks;

pub use memory::{MemoryStore, StoreOp};
pub use rocks::RocksStore;

use crate::error::StoreResult;
use crate::types::{Balance, HistoryFilter, TransactionId, TransactionRecord, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(doc)]
use crate::error::StoreError;

/// Balance row with its optimistic-concurrency version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedBalance {
    /// Current holdings
    pub balance: Balance,

    /// Bumped on every write, 0 for a user never written
    pub version: u64,
}

/// Conditional write that finishes one transaction
#[derive(Debug, Clone)]
pub struct Commit {
    /// Record in its terminal status
    pub transaction: TransactionRecord,

    /// Balance version the decision was based on
    pub expected_version: u64,

    /// New balance, `None` when the record was rejected
    pub new_balance: Option<Balance>,
}

/// Row-level client for the ledger tables
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Read a user's balance (zero at version 0 when absent)
    async fn load_balance(&self, user_id: &UserId) -> StoreResult<VersionedBalance>;

    /// Read a transaction by id
    async fn load_transaction(&self, id: &TransactionId) -> StoreResult<Option<TransactionRecord>>;

    /// Insert `record` unless its id exists; returns whichever row is stored
    async fn insert_transaction(&self, record: &TransactionRecord) -> StoreResult<TransactionRecord>;

    /// Apply a [`Commit`] atomically or not at all
    async fn commit(&self, commit: &Commit) -> StoreResult<()>;

    /// A user's records matching `filter`, newest first
    async fn user_transactions(
        &self,
        user_id: &UserId,
        filter: &HistoryFilter,
    ) -> StoreResult<Vec<TransactionRecord>>;

    /// PENDING records created before `created_before`, oldest first
    async fn pending_transactions(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransactionRecord>>;
}

/// Sort `(insert_seq, record)` pairs newest first and apply `filter.limit`
pub(crate) fn newest_first(
    mut records: Vec<(u64, TransactionRecord)>,
    filter: &HistoryFilter,
) -> Vec<TransactionRecord> {
    records.sort_by(|(seq_a, a), (seq_b, b)| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| seq_b.cmp(seq_a))
    });
    let limit = filter.limit.unwrap_or(records.len());
    records
        .into_iter()
        .take(limit)
        .map(|(_, record)| record)
        .collect()
}
