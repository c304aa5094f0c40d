//! WINIX Ledger Core
//!
//! Balance ledger for WINIX, tickets and FLEX.
//!
//! # Architecture
//!
//! - **Transaction records**: every balance change is an immutable intent
//!   keyed by a caller-chosen id, with a mutable lifecycle status
//! - **Exactly-once apply**: the id doubles as the idempotency key, so retried
//!   requests replay the stored outcome instead of applying again
//! - **Optimistic concurrency**: balance rows carry a version and commits are
//!   conditional, so concurrent updates to one user are additive
//! - **Pluggable store**: in-memory for tests and simulations, RocksDB for
//!   durable deployments
//!
//! # Invariants
//!
//! - No balance is ever negative in any currency
//! - A COMPLETED record has been reflected in its balance exactly once
//! - A balance equals the sum of its user's COMPLETED records
//! - Infrastructure failures leave records PENDING, never FAILED

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod retry;
pub mod storage;
pub mod types;
pub mod users;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RetryConfig};
pub use error::{LedgerError, Result, StoreError, StoreResult};
pub use ledger::{ConsistencyReport, Ledger, ReconcileReport};
pub use storage::{LedgerStore, MemoryStore, RocksStore};
pub use types::{
    Balance, Currency, Delta, HistoryFilter, Shortfall, TransactionId, TransactionKind,
    TransactionRecord, TransactionResult, TransactionStatus, UserId,
};
pub use users::{AcceptAllUsers, InMemoryUsers, UserDirectory};
