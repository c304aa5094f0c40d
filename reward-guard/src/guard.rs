//! Reward eligibility and claiming
//!
//! The guard decides whether a reward may be granted and turns an allowed
//! claim into a ledger credit. Every claim gets a deterministic id:
//!
//! | reward         | id                                          |
//! |----------------|---------------------------------------------|
//! | daily bonus    | `daily_bonus:{user}:{claim_no}`             |
//! | FLEX tier      | `flex_reward:{user}:{tier}:{claim_no}`      |
//! | wallet connect | `wallet_connect_bonus:{user}`               |
//!
//! `claim_no` is one more than the number of completed claims, so two
//! requests racing on the same history derive the same id and the ledger
//! lets only one of them apply.

use crate::config::GuardConfig;
use crate::types::{ClaimContext, ClaimEligibility, ClaimKind, ClaimOutcome, Denial, FlexTier};
use crate::{GuardError, Result};
use chrono::{DateTime, Duration, Utc};
use ledger_core::{
    Clock, Delta, HistoryFilter, Ledger, TransactionId, TransactionKind, TransactionRecord,
    TransactionStatus, UserId,
};
use std::sync::Arc;
use tracing::{debug, info};

const STREAK_DAY: &str = "streak_day";
const FLEX_TIER: &str = "flex_tier";
const WALLET: &str = "wallet_address";

/// Everything a claim needs, derived from a single read of the user's history
#[derive(Debug)]
struct ClaimPlan {
    eligibility: ClaimEligibility,
    transaction_id: TransactionId,
    reward: Delta,
    streak_day: Option<u32>,
    next_after_claim: Option<DateTime<Utc>>,
    metadata: Vec<(&'static str, String)>,
    stranded: Option<TransactionRecord>,
}

impl ClaimPlan {
    /// Finish a PENDING claim with its stored payload instead of a fresh one
    fn resume(&mut self, stranded: TransactionRecord) {
        self.reward = stranded.amount;
        if self.streak_day.is_some() {
            self.streak_day = stranded
                .metadata
                .get(STREAK_DAY)
                .and_then(|day| day.parse().ok());
        }
        self.stranded = Some(stranded);
    }
}

/// Idempotency guard for reward sources
#[derive(Debug)]
pub struct Guard {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
}

impl Guard {
    /// Create a guard over `ledger`, sharing its clock
    pub fn new(ledger: Arc<Ledger>, config: GuardConfig) -> Result<Self> {
        config.validate()?;
        let clock = ledger.clock();
        Ok(Self {
            ledger,
            clock,
            config,
        })
    }

    /// Whether `user_id` may claim `kind` now
    pub async fn can_claim(
        &self,
        user_id: &UserId,
        kind: ClaimKind,
        context: &ClaimContext,
    ) -> Result<ClaimEligibility> {
        let plan = self.plan(user_id, kind, context).await?;
        debug!(
            user_id = %user_id,
            kind = %kind,
            allowed = plan.eligibility.allowed,
            "Evaluated claim"
        );
        Ok(plan.eligibility)
    }

    /// Grant `kind` to `user_id` if allowed
    pub async fn claim(
        &self,
        user_id: &UserId,
        kind: ClaimKind,
        context: &ClaimContext,
    ) -> Result<ClaimOutcome> {
        let plan = self.plan(user_id, kind, context).await?;

        if let Some(denial) = plan.eligibility.denial {
            return Err(match denial {
                Denial::AlreadyClaimed => {
                    GuardError::AlreadyClaimed(format!("{} for user {}", kind, user_id))
                }
                Denial::TooEarly => match plan.eligibility.next_available_at {
                    Some(next_available_at) => GuardError::TooEarly { next_available_at },
                    None => GuardError::AlreadyClaimed(format!("{} for user {}", kind, user_id)),
                },
                Denial::NotEligible(reason) => GuardError::NotEligible(reason),
            });
        }

        let record = match plan.stranded {
            Some(stranded) => stranded,
            None => {
                let mut record = TransactionRecord::new(
                    plan.transaction_id.clone(),
                    user_id.clone(),
                    kind.transaction_kind(),
                    plan.reward,
                )
                .with_reference("reward", kind.to_string());
                for (key, value) in plan.metadata {
                    record = record.with_metadata(key, value);
                }
                record
            }
        };

        let transaction = self.ledger.apply(record).await?;
        if transaction.replayed {
            return Err(GuardError::AlreadyClaimed(format!(
                "{} for user {} was granted by {}",
                kind, user_id, plan.transaction_id
            )));
        }

        info!(
            user_id = %user_id,
            kind = %kind,
            transaction_id = %transaction.transaction_id,
            reward = %plan.reward,
            streak_day = plan.streak_day,
            "Reward granted"
        );

        Ok(ClaimOutcome {
            kind,
            reward: plan.reward,
            streak_day: plan.streak_day,
            transaction,
            next_available_at: plan.next_after_claim,
        })
    }

    /// Configuration
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    async fn plan(
        &self,
        user_id: &UserId,
        kind: ClaimKind,
        context: &ClaimContext,
    ) -> Result<ClaimPlan> {
        if user_id.as_str().trim().is_empty() {
            return Err(GuardError::Validation("user id is empty".to_string()));
        }
        let now = self.clock.now();

        let mut plan = match kind {
            ClaimKind::DailyBonus => self.plan_daily(user_id, now).await?,
            ClaimKind::FlexReward(tier) => self.plan_flex(user_id, tier, context, now).await?,
            ClaimKind::WalletConnect => self.plan_wallet(user_id, context).await?,
        };

        // An outage can leave this claim PENDING under a payload that no
        // longer matches today's reward
        if plan.eligibility.allowed {
            if let Some(stranded) = self.ledger.get_transaction(&plan.transaction_id).await? {
                if stranded.status == TransactionStatus::Pending {
                    debug!(
                        user_id = %user_id,
                        transaction_id = %stranded.id,
                        "Resuming pending claim"
                    );
                    plan.resume(stranded);
                }
            }
        }
        Ok(plan)
    }

    async fn plan_daily(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<ClaimPlan> {
        let policy = &self.config.daily_bonus;
        let claims = self
            .completed_claims(user_id, TransactionKind::DailyBonus, None)
            .await?;
        let cooldown = Duration::hours(policy.cooldown_hours);

        let streak_day = match claims.first() {
            Some(last) if now - claimed_at(last) <= Duration::hours(policy.streak_window_hours) => {
                let previous = last
                    .metadata
                    .get(STREAK_DAY)
                    .and_then(|day| day.parse::<u32>().ok())
                    .unwrap_or(1);
                // Cycles back to day 1 after the last table entry
                previous % policy.rewards.len() as u32 + 1
            }
            _ => 1,
        };
        let reward = policy.rewards[(streak_day - 1) as usize % policy.rewards.len()];
        let claim_no = (claims.len() + 1).to_string();

        Ok(ClaimPlan {
            eligibility: cooldown_check(claims.first(), cooldown, now),
            transaction_id: TransactionId::derived([
                TransactionKind::DailyBonus.code(),
                user_id.as_str(),
                claim_no.as_str(),
            ]),
            reward: reward.to_delta(),
            streak_day: Some(streak_day),
            next_after_claim: Some(now + cooldown),
            metadata: vec![(STREAK_DAY, streak_day.to_string())],
            stranded: None,
        })
    }

    async fn plan_flex(
        &self,
        user_id: &UserId,
        tier: FlexTier,
        context: &ClaimContext,
        now: DateTime<Utc>,
    ) -> Result<ClaimPlan> {
        let policy = self
            .config
            .flex_tier(tier)
            .ok_or_else(|| GuardError::Validation(format!("FLEX tier {} is not offered", tier)))?;
        let claims = self
            .completed_claims(user_id, TransactionKind::FlexReward, Some(tier))
            .await?;
        let cooldown = Duration::hours(policy.cooldown_hours);
        let claim_no = (claims.len() + 1).to_string();

        let eligibility = match context.flex_holdings {
            None => ClaimEligibility::denied(
                Denial::NotEligible("FLEX holdings unknown".to_string()),
                None,
            ),
            Some(holdings) if holdings < policy.required_flex => ClaimEligibility::denied(
                Denial::NotEligible(format!(
                    "tier {} needs {} FLEX, wallet holds {}",
                    tier, policy.required_flex, holdings
                )),
                None,
            ),
            Some(_) => cooldown_check(claims.first(), cooldown, now),
        };

        Ok(ClaimPlan {
            eligibility,
            transaction_id: TransactionId::derived([
                TransactionKind::FlexReward.code(),
                user_id.as_str(),
                tier.code(),
                claim_no.as_str(),
            ]),
            reward: policy.reward.to_delta(),
            streak_day: None,
            next_after_claim: Some(now + cooldown),
            metadata: vec![(FLEX_TIER, tier.code().to_string())],
            stranded: None,
        })
    }

    async fn plan_wallet(&self, user_id: &UserId, context: &ClaimContext) -> Result<ClaimPlan> {
        let transaction_id =
            TransactionId::derived([TransactionKind::WalletConnectBonus.code(), user_id.as_str()]);

        let wallet = context
            .wallet_address
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty());

        let eligibility = match wallet {
            None => ClaimEligibility::denied(
                Denial::NotEligible("no wallet connected".to_string()),
                None,
            ),
            Some(_) => match self.ledger.get_transaction(&transaction_id).await? {
                Some(existing) if existing.status == TransactionStatus::Completed => {
                    ClaimEligibility::denied(Denial::AlreadyClaimed, None)
                }
                _ => ClaimEligibility::allowed(),
            },
        };

        Ok(ClaimPlan {
            eligibility,
            transaction_id,
            reward: self.config.wallet_connect_bonus.to_delta(),
            streak_day: None,
            next_after_claim: None,
            metadata: wallet
                .map(|address| vec![(WALLET, address.to_string())])
                .unwrap_or_default(),
            stranded: None,
        })
    }

    /// COMPLETED claims of one kind, newest first
    async fn completed_claims(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        tier: Option<FlexTier>,
    ) -> Result<Vec<TransactionRecord>> {
        let filter = HistoryFilter::all()
            .kind(kind)
            .status(TransactionStatus::Completed);
        let mut claims = self.ledger.history(user_id, &filter).await?;
        if let Some(tier) = tier {
            claims.retain(|record| record.metadata.get(FLEX_TIER).map(String::as_str) == Some(tier.code()));
        }
        Ok(claims)
    }
}

fn claimed_at(record: &TransactionRecord) -> DateTime<Utc> {
    record.processed_at.unwrap_or(record.created_at)
}

fn cooldown_check(
    last: Option<&TransactionRecord>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> ClaimEligibility {
    match last {
        Some(last) => {
            let next = claimed_at(last) + cooldown;
            if now < next {
                ClaimEligibility::denied(Denial::TooEarly, Some(next))
            } else {
                ClaimEligibility::allowed()
            }
        }
        None => ClaimEligibility::allowed(),
    }
}
