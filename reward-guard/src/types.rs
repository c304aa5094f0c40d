//! Claim types

use chrono::{DateTime, Utc};
use ledger_core::{Delta, TransactionKind, TransactionResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// FLEX holdings tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlexTier {
    /// Entry tier
    Bronze,
    /// Second tier
    Silver,
    /// Third tier
    Gold,
    /// Fourth tier
    Platinum,
    /// Top tier
    Diamond,
}

impl FlexTier {
    /// Lowercase code, used in claim ids
    pub fn code(&self) -> &'static str {
        match self {
            FlexTier::Bronze => "bronze",
            FlexTier::Silver => "silver",
            FlexTier::Gold => "gold",
            FlexTier::Platinum => "platinum",
            FlexTier::Diamond => "diamond",
        }
    }
}

impl fmt::Display for FlexTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Reward source a claim is made against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimKind {
    /// Daily login bonus with streak
    DailyBonus,
    /// FLEX holdings reward for one tier
    FlexReward(FlexTier),
    /// One-time wallet connection bonus
    WalletConnect,
}

impl ClaimKind {
    /// Ledger transaction kind the reward is recorded as
    pub fn transaction_kind(&self) -> TransactionKind {
        match self {
            ClaimKind::DailyBonus => TransactionKind::DailyBonus,
            ClaimKind::FlexReward(_) => TransactionKind::FlexReward,
            ClaimKind::WalletConnect => TransactionKind::WalletConnectBonus,
        }
    }
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKind::FlexReward(tier) => write!(f, "flex_reward:{}", tier),
            other => write!(f, "{}", other.transaction_kind()),
        }
    }
}

/// Facts about the user supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimContext {
    /// FLEX held in the user's connected wallet
    pub flex_holdings: Option<i64>,

    /// Connected wallet address
    pub wallet_address: Option<String>,
}

impl ClaimContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set FLEX holdings
    pub fn with_flex_holdings(mut self, holdings: i64) -> Self {
        self.flex_holdings = Some(holdings);
        self
    }

    /// Set wallet address
    pub fn with_wallet(mut self, address: impl Into<String>) -> Self {
        self.wallet_address = Some(address.into());
        self
    }
}

/// Why a claim is not allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// One-time reward already granted
    AlreadyClaimed,
    /// Cooldown still running
    TooEarly,
    /// Requirement not met
    NotEligible(String),
}

/// Answer to "may this user claim now"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEligibility {
    /// Claim may proceed
    pub allowed: bool,

    /// Earliest instant a denied claim becomes possible, when known
    pub next_available_at: Option<DateTime<Utc>>,

    /// Reason for a denial
    pub denial: Option<Denial>,
}

impl ClaimEligibility {
    pub(crate) fn allowed() -> Self {
        Self {
            allowed: true,
            next_available_at: None,
            denial: None,
        }
    }

    pub(crate) fn denied(denial: Denial, next_available_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            next_available_at,
            denial: Some(denial),
        }
    }
}

/// A granted reward
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimOutcome {
    /// Reward source
    pub kind: ClaimKind,

    /// Amount credited
    pub reward: Delta,

    /// Streak day of a daily bonus (1-based)
    pub streak_day: Option<u32>,

    /// Ledger result of the credit
    pub transaction: TransactionResult,

    /// When the next claim of this kind opens, if ever
    pub next_available_at: Option<DateTime<Utc>>,
}
