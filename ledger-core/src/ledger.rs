//! Ledger engine
//!
//! Applies [`TransactionRecord`]s to balances exactly once. Each attempt runs
//! the same steps against the store:
//!
//! 1. Load the record by id, inserting it as PENDING when absent
//! 2. Replay the stored outcome if the record is already terminal
//! 3. Read the balance with its version and evaluate the delta
//! 4. Commit the terminal record (and the new balance) conditionally
//!
//! A lost conditional commit or a transient store error restarts the attempt.
//! Because step 1 keys on the record id, an attempt whose commit landed but
//! whose acknowledgement was lost replays on the next pass instead of
//! applying twice.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Config, Delta, Ledger, TransactionId, TransactionKind, TransactionRecord, UserId};
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!
//!     let record = TransactionRecord::new(
//!         TransactionId::derived(["task_reward", "42", "follow_channel"]),
//!         UserId::new("42"),
//!         TransactionKind::TaskReward,
//!         Delta::tickets(5),
//!     );
//!     let result = ledger.apply(record).await?;
//!     println!("tickets now {}", result.balance.tickets);
//!     Ok(())
//! }
//! ```

use crate::{
    clock::{Clock, SystemClock},
    error::{LedgerError, Result, StoreError, StoreResult},
    metrics::Metrics,
    retry::{RetryError, RetryPolicy},
    storage::{Commit, LedgerStore, RocksStore},
    types::{
        Balance, Delta, HistoryFilter, TransactionId, TransactionRecord, TransactionResult,
        TransactionStatus, UserId,
    },
    users::{AcceptAllUsers, UserDirectory},
    Config,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Outcome of one successful pass through the apply steps
enum Settled {
    /// This pass committed the record
    Applied(TransactionRecord),
    /// The record was already terminal
    Replayed(TransactionRecord),
    /// The id belongs to a different intent
    Mismatch(TransactionRecord),
}

/// Summary of a [`Ledger::reconcile_pending`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// PENDING records examined
    pub scanned: usize,
    /// Records that reached COMPLETED
    pub completed: usize,
    /// Records that reached FAILED
    pub rejected: usize,
    /// Records still PENDING (store still unavailable)
    pub still_pending: usize,
}

/// Result of [`Ledger::verify_consistency`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    /// User checked
    pub user_id: UserId,
    /// Balance row as stored
    pub stored: Balance,
    /// Sum of every COMPLETED record
    pub computed: Delta,
    /// COMPLETED records summed
    pub completed_records: usize,
}

impl ConsistencyReport {
    /// Stored balance equals the sum of completed records
    pub fn is_consistent(&self) -> bool {
        self.stored.winix == self.computed.winix
            && self.stored.tickets == self.computed.tickets
            && self.stored.flex == self.computed.flex
    }
}

/// Main ledger interface
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    users: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    store_timeout: Duration,
    metrics: Metrics,
    config: Config,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("service_name", &self.config.service_name)
            .field("store_timeout", &self.store_timeout)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Build a ledger over an injected store, user directory and clock
    pub fn new(
        store: Arc<dyn LedgerStore>,
        users: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| LedgerError::Config(format!("Failed to register metrics: {}", e)))?;
        let retry = RetryPolicy::new(config.retry.clone()).with_counter(metrics.store_retries.clone());

        Ok(Self {
            store,
            users,
            clock,
            retry,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            metrics,
            config,
        })
    }

    /// Open a RocksDB-backed ledger on the wall clock, accepting every user
    pub fn open(config: Config) -> Result<Self> {
        let store = Arc::new(RocksStore::open(&config)?);
        Self::new(store, Arc::new(AcceptAllUsers), Arc::new(SystemClock), config)
    }

    /// Apply a record exactly once
    ///
    /// Returns the same terminal answer for every call with the same id.
    /// A rejected debit is stored as FAILED and reported as
    /// [`LedgerError::InsufficientFunds`]. When the store stays unavailable
    /// the record is left PENDING and [`LedgerError::StoreUnavailable`] is
    /// returned.
    pub async fn apply(&self, mut record: TransactionRecord) -> Result<TransactionResult> {
        let timer = self.metrics.apply_duration.start_timer();

        self.validate(&record)?;
        self.ensure_user(&record.user_id).await?;

        record.status = TransactionStatus::Pending;
        record.created_at = self.clock.now();
        record.processed_at = None;
        record.balance_after = None;
        record.failure = None;
        record.error_message = None;

        let result = self.settle(&record).await;
        timer.observe_duration();
        result
    }

    /// Current balance (zero for a user never written)
    pub async fn get_balance(&self, user_id: &UserId) -> Result<Balance> {
        let row = self
            .read("load_balance", || self.store.load_balance(user_id))
            .await?;
        Ok(row.balance)
    }

    /// A user's records, newest first
    pub async fn history(
        &self,
        user_id: &UserId,
        filter: &HistoryFilter,
    ) -> Result<Vec<TransactionRecord>> {
        self.read("user_transactions", || {
            self.store.user_transactions(user_id, filter)
        })
        .await
    }

    /// Look up a record by id
    pub async fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>> {
        self.read("load_transaction", || self.store.load_transaction(id))
            .await
    }

    /// Re-drive PENDING records older than `older_than` through the apply path
    pub async fn reconcile_pending(
        &self,
        older_than: chrono::Duration,
        limit: usize,
    ) -> Result<ReconcileReport> {
        let cutoff = self.clock.now() - older_than;
        let pending = self
            .read("pending_transactions", || {
                self.store.pending_transactions(cutoff, limit)
            })
            .await?;

        let mut report = ReconcileReport {
            scanned: pending.len(),
            ..ReconcileReport::default()
        };

        for record in pending {
            match self.settle(&record).await {
                Ok(_) => report.completed += 1,
                Err(LedgerError::InsufficientFunds { .. }) => report.rejected += 1,
                Err(e) => {
                    warn!(
                        transaction_id = %record.id,
                        user_id = %record.user_id,
                        error = %e,
                        "Pending transaction not settled"
                    );
                    report.still_pending += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                completed = report.completed,
                rejected = report.rejected,
                still_pending = report.still_pending,
                "Reconciled pending transactions"
            );
        }
        Ok(report)
    }

    /// Compare a stored balance with the sum of the user's COMPLETED records
    pub async fn verify_consistency(&self, user_id: &UserId) -> Result<ConsistencyReport> {
        let stored = self.get_balance(user_id).await?;
        let records = self
            .history(user_id, &HistoryFilter::all().status(TransactionStatus::Completed))
            .await?;

        let mut computed = Delta::default();
        for record in &records {
            computed = computed.checked_add(&record.amount).ok_or_else(|| {
                LedgerError::Validation(format!("history of {} overflows", user_id))
            })?;
        }

        let report = ConsistencyReport {
            user_id: user_id.clone(),
            stored,
            computed,
            completed_records: records.len(),
        };
        if !report.is_consistent() {
            error!(
                user_id = %user_id,
                stored = %report.stored,
                computed = %report.computed,
                "Balance does not match completed transactions"
            );
        }
        Ok(report)
    }

    /// Metrics for this instance
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Clock shared with the engines built on this ledger
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn validate(&self, record: &TransactionRecord) -> Result<()> {
        if record.id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation("transaction id is empty".to_string()));
        }
        if record.user_id.as_str().trim().is_empty() {
            return Err(LedgerError::Validation("user id is empty".to_string()));
        }
        if record.amount.is_zero() {
            return Err(LedgerError::Validation(format!(
                "transaction {} changes nothing",
                record.id
            )));
        }
        if record.amount.winix.normalize().scale() > self.config.winix_scale {
            return Err(LedgerError::Validation(format!(
                "WINIX amount {} has more than {} decimal places",
                record.amount.winix, self.config.winix_scale
            )));
        }
        Ok(())
    }

    async fn ensure_user(&self, user_id: &UserId) -> Result<()> {
        let exists = self
            .read("user_exists", || self.users.exists(user_id))
            .await?;
        if exists {
            Ok(())
        } else {
            Err(LedgerError::UserNotFound(user_id.to_string()))
        }
    }

    async fn settle(&self, record: &TransactionRecord) -> Result<TransactionResult> {
        let unacked = Mutex::new(None);
        let unacked = &unacked;

        let settled = self
            .retry
            .execute("apply", move || self.try_apply(record, unacked))
            .await
            .map_err(|e| self.exhausted(e, Some(record)))?;

        let (stored, replayed) = match settled {
            Settled::Applied(stored) => (stored, false),
            // Our own commit landed on an earlier pass and only its ack was lost
            Settled::Replayed(stored) => {
                let ours = unacked.lock().as_ref() == Some(&stored);
                (stored, !ours)
            }
            Settled::Mismatch(stored) => {
                warn!(
                    transaction_id = %stored.id,
                    stored_user = %stored.user_id,
                    stored_amount = %stored.amount,
                    "Transaction id reused with a different payload"
                );
                return Err(LedgerError::IdempotencyMismatch(stored.id));
            }
        };

        if replayed {
            self.metrics.replayed_total.inc();
            debug!(transaction_id = %stored.id, status = ?stored.status, "Replayed transaction");
        } else {
            match stored.status {
                TransactionStatus::Completed => {
                    self.metrics.applied_total.inc();
                    info!(
                        transaction_id = %stored.id,
                        user_id = %stored.user_id,
                        kind = %stored.kind,
                        amount = %stored.amount,
                        "Transaction applied"
                    );
                }
                TransactionStatus::Failed => {
                    self.metrics.rejected_total.inc();
                    warn!(
                        transaction_id = %stored.id,
                        user_id = %stored.user_id,
                        kind = %stored.kind,
                        reason = stored.error_message.as_deref().unwrap_or_default(),
                        "Transaction rejected"
                    );
                }
                _ => {}
            }
        }

        self.outcome(stored, replayed).await
    }

    async fn outcome(&self, stored: TransactionRecord, replayed: bool) -> Result<TransactionResult> {
        match stored.status {
            TransactionStatus::Failed => match stored.failure {
                Some(shortfall) => Err(LedgerError::InsufficientFunds {
                    currency: shortfall.currency,
                    available: shortfall.available,
                    requested: shortfall.requested,
                }),
                None => Err(LedgerError::Validation(
                    stored
                        .error_message
                        .unwrap_or_else(|| format!("transaction {} failed", stored.id)),
                )),
            },
            status => {
                let balance = match stored.balance_after {
                    Some(balance) => balance,
                    None => self.get_balance(&stored.user_id).await?,
                };
                Ok(TransactionResult {
                    transaction_id: stored.id,
                    status,
                    balance,
                    replayed,
                })
            }
        }
    }

    async fn try_apply(
        &self,
        record: &TransactionRecord,
        unacked: &Mutex<Option<TransactionRecord>>,
    ) -> StoreResult<Settled> {
        let stored = match self
            .timed("load_transaction", self.store.load_transaction(&record.id))
            .await?
        {
            Some(existing) => existing,
            None => {
                self.timed("insert_transaction", self.store.insert_transaction(record))
                    .await?
            }
        };

        if !stored.same_intent(record) {
            return Ok(Settled::Mismatch(stored));
        }
        if stored.status.is_terminal() {
            return Ok(Settled::Replayed(stored));
        }

        let current = self
            .timed("load_balance", self.store.load_balance(&stored.user_id))
            .await?;
        let now = self.clock.now();

        let (terminal, new_balance) = match current.balance.checked_apply(&stored.amount) {
            Ok(balance) => (stored.completed(balance, now), Some(balance)),
            Err(shortfall) => (stored.failed(shortfall, now), None),
        };

        let commit = Commit {
            transaction: terminal,
            expected_version: current.version,
            new_balance,
        };
        match self.timed("commit", self.store.commit(&commit)).await {
            Ok(()) => Ok(Settled::Applied(commit.transaction)),
            // A lost race wrote nothing
            Err(err @ StoreError::Conflict(_)) => Err(err),
            Err(err) => {
                *unacked.lock() = Some(commit.transaction);
                Err(err)
            }
        }
    }

    async fn read<T, F, Fut>(&self, operation_name: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.retry
            .execute(operation_name, || self.timed(operation_name, operation()))
            .await
            .map_err(|e| self.exhausted(e, None))
    }

    async fn timed<T>(
        &self,
        operation_name: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{} exceeded {}ms",
                operation_name,
                self.store_timeout.as_millis()
            ))),
        }
    }

    fn exhausted(&self, err: RetryError, record: Option<&TransactionRecord>) -> LedgerError {
        match err {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => {
                if let Some(record) = record {
                    error!(
                        transaction_id = %record.id,
                        user_id = %record.user_id,
                        attempts,
                        error = %last_error,
                        "Store unavailable, transaction left pending"
                    );
                }
                LedgerError::StoreUnavailable {
                    attempts,
                    last_error,
                }
            }
            RetryError::Fatal(e) => LedgerError::Store(e),
        }
    }
}
