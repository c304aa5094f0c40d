//! Reward Guard for WINIX
//!
//! Decides whether a reward may be granted before any ledger record exists,
//! and grants allowed rewards through the ledger under deterministic ids.
//!
//! Reward sources:
//!
//! - **Daily bonus**: cooldown plus a streak that cycles over a reward table
//! - **FLEX tiers**: holdings threshold, cooldown per tier
//! - **Wallet connect**: once per user, tracked by the existence of its record

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod guard;
pub mod types;

pub use config::{DailyBonusPolicy, FlexTierPolicy, GuardConfig, RewardAmount};
pub use error::{GuardError, Result};
pub use guard::Guard;
pub use types::*;
