//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for WINIX, integers for tickets and FLEX)
//! - Immutable intent, mutable status (TransactionRecord)

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User identifier (Telegram user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create new user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, doubles as the idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap a caller-supplied id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered id (UUIDv7)
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Build a deterministic id from its parts, joined with `:`
    ///
    /// Two requests describing the same event derive the same id, so the
    /// ledger collapses them into one application.
    pub fn derived<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self(joined)
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currencies held in a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    /// WINIX, fractional
    Winix,
    /// Raffle tickets, whole units
    Tickets,
    /// FLEX tokens, whole units
    Flex,
}

impl Currency {
    /// All currencies, in balance order
    pub const ALL: [Currency; 3] = [Currency::Winix, Currency::Tickets, Currency::Flex];

    /// Lowercase code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Winix => "winix",
            Currency::Tickets => "tickets",
            Currency::Flex => "flex",
        }
    }

    /// Whether amounts in this currency must be whole numbers
    pub fn is_integral(&self) -> bool {
        !matches!(self, Currency::Winix)
    }
}

impl FromStr for Currency {
    type Err = crate::LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "winix" => Ok(Currency::Winix),
            "tickets" | "coins" => Ok(Currency::Tickets),
            "flex" => Ok(Currency::Flex),
            other => Err(crate::LedgerError::Validation(format!(
                "unknown currency '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Signed per-currency change carried by a transaction (negative = debit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// WINIX change
    pub winix: Decimal,
    /// Ticket change
    pub tickets: i64,
    /// FLEX change
    pub flex: i64,
}

impl Delta {
    /// WINIX-only change
    pub fn winix(amount: Decimal) -> Self {
        Self {
            winix: amount,
            ..Self::default()
        }
    }

    /// Ticket-only change
    pub fn tickets(amount: i64) -> Self {
        Self {
            tickets: amount,
            ..Self::default()
        }
    }

    /// FLEX-only change
    pub fn flex(amount: i64) -> Self {
        Self {
            flex: amount,
            ..Self::default()
        }
    }

    /// Single-currency change from a decimal amount
    ///
    /// Returns `None` when an integral currency is given a fractional amount
    /// or the amount does not fit.
    pub fn of(currency: Currency, amount: Decimal) -> Option<Self> {
        match currency {
            Currency::Winix => Some(Self::winix(amount)),
            Currency::Tickets => integral(amount).map(Self::tickets),
            Currency::Flex => integral(amount).map(Self::flex),
        }
    }

    /// Amount for one currency, as a decimal
    pub fn get(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Winix => self.winix,
            Currency::Tickets => Decimal::from(self.tickets),
            Currency::Flex => Decimal::from(self.flex),
        }
    }

    /// All components are zero
    pub fn is_zero(&self) -> bool {
        self.winix.is_zero() && self.tickets == 0 && self.flex == 0
    }

    /// Any component is negative
    pub fn is_debit(&self) -> bool {
        self.winix < Decimal::ZERO || self.tickets < 0 || self.flex < 0
    }

    /// Opposite change
    pub fn negate(&self) -> Self {
        Self {
            winix: -self.winix,
            tickets: -self.tickets,
            flex: -self.flex,
        }
    }

    /// Component-wise sum, `None` on integer overflow
    pub fn checked_add(&self, other: &Delta) -> Option<Self> {
        Some(Self {
            winix: self.winix.checked_add(other.winix)?,
            tickets: self.tickets.checked_add(other.tickets)?,
            flex: self.flex.checked_add(other.flex)?,
        })
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "winix={} tickets={} flex={}",
            self.winix, self.tickets, self.flex
        )
    }
}

fn integral(amount: Decimal) -> Option<i64> {
    if amount.fract().is_zero() {
        amount.to_i64()
    } else {
        None
    }
}

/// A user's holdings. Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// WINIX holdings
    pub winix: Decimal,
    /// Ticket holdings
    pub tickets: i64,
    /// FLEX holdings
    pub flex: i64,
}

impl Balance {
    /// Empty balance
    pub fn zero() -> Self {
        Self::default()
    }

    /// Holding for one currency, as a decimal
    pub fn get(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Winix => self.winix,
            Currency::Tickets => Decimal::from(self.tickets),
            Currency::Flex => Decimal::from(self.flex),
        }
    }

    /// Apply a delta, refusing to go below zero in any currency
    pub fn checked_apply(&self, delta: &Delta) -> Result<Balance, Shortfall> {
        let winix = self.winix.checked_add(delta.winix);
        let tickets = self.tickets.checked_add(delta.tickets);
        let flex = self.flex.checked_add(delta.flex);

        for currency in Currency::ALL {
            let negative = match currency {
                Currency::Winix => winix.map_or(true, |v| v < Decimal::ZERO),
                Currency::Tickets => tickets.map_or(true, |v| v < 0),
                Currency::Flex => flex.map_or(true, |v| v < 0),
            };
            if negative {
                return Err(Shortfall {
                    currency,
                    available: self.get(currency),
                    requested: -delta.get(currency),
                });
            }
        }

        match (winix, tickets, flex) {
            (Some(winix), Some(tickets), Some(flex)) => Ok(Balance {
                winix,
                tickets,
                flex,
            }),
            _ => Err(Shortfall {
                currency: Currency::Winix,
                available: self.winix,
                requested: -delta.winix,
            }),
        }
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "winix={} tickets={} flex={}",
            self.winix, self.tickets, self.flex
        )
    }
}

/// Why a debit could not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    /// Currency that would go negative
    pub currency: Currency,
    /// Holding at evaluation time
    pub available: Decimal,
    /// Amount the debit asked for
    pub requested: Decimal,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "insufficient {}: available {}, requested {}",
            self.currency, self.available, self.requested
        )
    }
}

/// What kind of event a transaction records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Daily login bonus
    DailyBonus,
    /// FLEX holdings tier reward
    FlexReward,
    /// Task completion reward
    TaskReward,
    /// Referral bonus
    ReferralBonus,
    /// One-time wallet connection bonus
    WalletConnectBonus,
    /// Raffle entry fee (debit)
    RaffleEntryFee,
    /// Raffle prize payout
    RafflePayout,
    /// Raffle entry refund
    RaffleRefund,
    /// Operator adjustment
    AdminAdjustment,
}

impl TransactionKind {
    /// Stable snake_case code, used in derived ids
    pub fn code(&self) -> &'static str {
        match self {
            TransactionKind::DailyBonus => "daily_bonus",
            TransactionKind::FlexReward => "flex_reward",
            TransactionKind::TaskReward => "task_reward",
            TransactionKind::ReferralBonus => "referral_bonus",
            TransactionKind::WalletConnectBonus => "wallet_connect_bonus",
            TransactionKind::RaffleEntryFee => "raffle_entry_fee",
            TransactionKind::RafflePayout => "raffle_payout",
            TransactionKind::RaffleRefund => "raffle_refund",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = crate::LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "daily_bonus" => TransactionKind::DailyBonus,
            "flex_reward" => TransactionKind::FlexReward,
            "task_reward" => TransactionKind::TaskReward,
            "referral_bonus" => TransactionKind::ReferralBonus,
            "wallet_connect_bonus" => TransactionKind::WalletConnectBonus,
            "raffle_entry_fee" => TransactionKind::RaffleEntryFee,
            "raffle_payout" => TransactionKind::RafflePayout,
            "raffle_refund" => TransactionKind::RaffleRefund,
            "admin_adjustment" => TransactionKind::AdminAdjustment,
            other => {
                return Err(crate::LedgerError::Validation(format!(
                    "unknown transaction kind '{}'",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Recorded, not yet reflected in the balance
    Pending = 1,
    /// Reflected in the balance exactly once (terminal)
    Completed = 2,
    /// Validated and rejected, balance untouched (terminal)
    Failed = 3,
    /// Withdrawn before application (terminal)
    Cancelled = 4,
    /// Reversed by a later refund (terminal)
    Refunded = 5,
}

impl TransactionStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// One balance change: immutable intent plus mutable status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Idempotency key
    pub id: TransactionId,

    /// Owner of the balance being changed
    pub user_id: UserId,

    /// Event kind
    pub kind: TransactionKind,

    /// Signed change per currency
    pub amount: Delta,

    /// Lifecycle status
    pub status: TransactionStatus,

    /// Originating entity id (e.g. raffle id)
    pub reference_id: Option<String>,

    /// Originating entity type (e.g. "raffle")
    pub reference_type: Option<String>,

    /// Free-form audit payload
    pub metadata: BTreeMap<String, String>,

    /// Rejection detail for FAILED records
    pub error_message: Option<String>,

    /// Structured rejection reason for FAILED records
    pub failure: Option<Shortfall>,

    /// Balance right after this record completed
    pub balance_after: Option<Balance>,

    /// When the ledger first recorded the intent
    pub created_at: DateTime<Utc>,

    /// When the record reached a terminal status
    pub processed_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    /// New PENDING record
    pub fn new(id: TransactionId, user_id: UserId, kind: TransactionKind, amount: Delta) -> Self {
        Self {
            id,
            user_id,
            kind,
            amount,
            status: TransactionStatus::Pending,
            reference_id: None,
            reference_type: None,
            metadata: BTreeMap::new(),
            error_message: None,
            failure: None,
            balance_after: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    /// Link to the originating entity
    pub fn with_reference(
        mut self,
        reference_type: impl Into<String>,
        reference_id: impl Into<String>,
    ) -> Self {
        self.reference_type = Some(reference_type.into());
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Attach an audit entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether `other` describes the same intent (same key, same effect)
    pub fn same_intent(&self, other: &TransactionRecord) -> bool {
        self.id == other.id
            && self.user_id == other.user_id
            && self.kind == other.kind
            && self.amount == other.amount
    }

    /// Completed copy of this record
    pub fn completed(&self, balance_after: Balance, at: DateTime<Utc>) -> Self {
        let mut record = self.clone();
        record.status = TransactionStatus::Completed;
        record.balance_after = Some(balance_after);
        record.processed_at = Some(at);
        record
    }

    /// Failed copy of this record
    pub fn failed(&self, shortfall: Shortfall, at: DateTime<Utc>) -> Self {
        let mut record = self.clone();
        record.status = TransactionStatus::Failed;
        record.error_message = Some(shortfall.to_string());
        record.failure = Some(shortfall);
        record.processed_at = Some(at);
        record
    }
}

/// Result of applying a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Record id
    pub transaction_id: TransactionId,

    /// Terminal status reached
    pub status: TransactionStatus,

    /// Balance right after the record completed
    pub balance: Balance,

    /// True when this call found the record already applied
    pub replayed: bool,
}

/// Filters for transaction history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    /// Only these kinds (empty = all)
    pub kinds: Vec<TransactionKind>,

    /// Only this status
    pub status: Option<TransactionStatus>,

    /// Only records linked to this entity id
    pub reference_id: Option<String>,

    /// Only records created at or after this instant
    pub since: Option<DateTime<Utc>>,

    /// Maximum number of records
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// Everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one kind
    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Restrict to one status
    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to one reference id
    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Restrict to records created at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Cap the result size
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record passes every filter except `limit`
    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(ref reference_id) = self.reference_id {
            if record.reference_id.as_deref() != Some(reference_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        true
    }
}
