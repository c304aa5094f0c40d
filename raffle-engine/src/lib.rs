//! WINIX Raffle Engine
//!
//! Raffles paid for and settled through the WINIX ledger.
//!
//! # Lifecycle
//!
//! ```text
//! ACTIVE --finalize--> FINALIZING --> COMPLETED
//!    \
//!     `---cancel----> CANCELLING --> CANCELLED
//! ```
//!
//! - **Entries**: each entry costs the raffle's fee; a user's entries are
//!   their weight in the draw
//! - **Draw**: weighted, without replacement, one place per user
//! - **Payouts and refunds**: ledger records under deterministic ids, so an
//!   interrupted settlement resumes without paying twice
//!
//! # Invariants
//!
//! - A raffle is settled at most once: every winner paid, or every entry
//!   refunded, never both
//! - An entry fee counts once into exactly one participation, or is refunded

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod distribution;
pub mod draw;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-exports
pub use config::{Config, SchedulerConfig};
pub use distribution::compute_distribution;
pub use draw::{OsRandom, RandomSource, SeededRandom};
pub use engine::RaffleEngine;
pub use error::{RaffleError, Result};
pub use metrics::RaffleMetrics;
pub use scheduler::{Scheduler, SchedulerReport};
pub use store::{MemoryRaffleStore, RaffleStore, RocksRaffleStore};
pub use types::*;
