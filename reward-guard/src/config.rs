//! Reward policy configuration

use crate::types::FlexTier;
use crate::{GuardError, Result};
use ledger_core::Delta;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Amount granted by one reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardAmount {
    /// WINIX credited
    pub winix: Decimal,

    /// Tickets credited
    pub tickets: i64,
}

impl RewardAmount {
    /// Reward of `winix` WINIX and `tickets` tickets
    pub fn new(winix: Decimal, tickets: i64) -> Self {
        Self { winix, tickets }
    }

    /// Ledger delta for this reward
    pub fn to_delta(&self) -> Delta {
        Delta {
            winix: self.winix,
            tickets: self.tickets,
            flex: 0,
        }
    }
}

/// Daily login bonus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBonusPolicy {
    /// Minimum gap between two claims (hours)
    pub cooldown_hours: i64,

    /// A claim later than this after the previous one restarts the streak (hours)
    pub streak_window_hours: i64,

    /// Reward for streak day 1, 2, ... (cycles after the last entry)
    pub rewards: Vec<RewardAmount>,
}

impl Default for DailyBonusPolicy {
    fn default() -> Self {
        let table = [(10, 0), (15, 0), (20, 1), (25, 1), (30, 2), (40, 2), (50, 3)];
        Self {
            cooldown_hours: 20,
            streak_window_hours: 48,
            rewards: table
                .iter()
                .map(|(winix, tickets)| RewardAmount::new(Decimal::from(*winix), *tickets))
                .collect(),
        }
    }
}

/// Reward for holding FLEX above a threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexTierPolicy {
    /// Tier name
    pub tier: FlexTier,

    /// FLEX holdings required
    pub required_flex: i64,

    /// Reward per claim
    pub reward: RewardAmount,

    /// Minimum gap between two claims of this tier (hours)
    pub cooldown_hours: i64,
}

fn default_flex_tiers() -> Vec<FlexTierPolicy> {
    [
        (FlexTier::Bronze, 25_000, 15, 1),
        (FlexTier::Silver, 100_000, 50, 3),
        (FlexTier::Gold, 500_000, 150, 5),
        (FlexTier::Platinum, 1_000_000, 300, 10),
        (FlexTier::Diamond, 5_000_000, 1_000, 20),
    ]
    .iter()
    .map(|(tier, required_flex, winix, tickets)| FlexTierPolicy {
        tier: *tier,
        required_flex: *required_flex,
        reward: RewardAmount::new(Decimal::from(*winix), *tickets),
        cooldown_hours: 24,
    })
    .collect()
}

/// Reward guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Daily bonus policy
    pub daily_bonus: DailyBonusPolicy,

    /// FLEX tier table
    pub flex_tiers: Vec<FlexTierPolicy>,

    /// One-time wallet connection bonus
    pub wallet_connect_bonus: RewardAmount,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            daily_bonus: DailyBonusPolicy::default(),
            flex_tiers: default_flex_tiers(),
            wallet_connect_bonus: RewardAmount::new(Decimal::from(100), 0),
        }
    }
}

impl GuardConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GuardError::InvalidConfig(format!("Failed to read config: {}", e)))?;
        let config: GuardConfig = toml::from_str(&content)
            .map_err(|e| GuardError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Policy for one FLEX tier
    pub fn flex_tier(&self, tier: FlexTier) -> Option<&FlexTierPolicy> {
        self.flex_tiers.iter().find(|policy| policy.tier == tier)
    }

    /// Check the tables are usable
    pub fn validate(&self) -> Result<()> {
        let daily = &self.daily_bonus;
        if daily.rewards.is_empty() {
            return Err(GuardError::InvalidConfig(
                "daily bonus reward table is empty".to_string(),
            ));
        }
        if daily.cooldown_hours <= 0 || daily.streak_window_hours < daily.cooldown_hours {
            return Err(GuardError::InvalidConfig(format!(
                "daily bonus cooldown {}h must be positive and within the streak window {}h",
                daily.cooldown_hours, daily.streak_window_hours
            )));
        }

        let rewards = daily
            .rewards
            .iter()
            .chain(self.flex_tiers.iter().map(|policy| &policy.reward))
            .chain(std::iter::once(&self.wallet_connect_bonus));
        for reward in rewards {
            if reward.winix < Decimal::ZERO || reward.tickets < 0 || reward.to_delta().is_zero() {
                return Err(GuardError::InvalidConfig(format!(
                    "reward {} WINIX / {} tickets must be positive",
                    reward.winix, reward.tickets
                )));
            }
        }

        for (i, policy) in self.flex_tiers.iter().enumerate() {
            if policy.required_flex <= 0 || policy.cooldown_hours <= 0 {
                return Err(GuardError::InvalidConfig(format!(
                    "FLEX tier {} needs positive requirement and cooldown",
                    policy.tier
                )));
            }
            if self.flex_tiers[..i].iter().any(|p| p.tier == policy.tier) {
                return Err(GuardError::InvalidConfig(format!(
                    "FLEX tier {} configured twice",
                    policy.tier
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GuardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.daily_bonus.cooldown_hours, 20);
        assert_eq!(config.flex_tiers.len(), 5);
        assert_eq!(
            config.flex_tier(FlexTier::Gold).map(|p| p.required_flex),
            Some(500_000)
        );
    }

    #[test]
    fn test_rejects_empty_reward_table() {
        let mut config = GuardConfig::default();
        config.daily_bonus.rewards.clear();
        assert!(matches!(config.validate(), Err(GuardError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_duplicate_tier() {
        let mut config = GuardConfig::default();
        let gold = config.flex_tiers[2].clone();
        config.flex_tiers.push(gold);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.toml");
        let mut config = GuardConfig::default();
        config.wallet_connect_bonus = RewardAmount::new(Decimal::from(250), 2);
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = GuardConfig::from_file(&path).unwrap();
        assert_eq!(loaded.wallet_connect_bonus, config.wallet_connect_bonus);
        assert_eq!(loaded.daily_bonus.rewards.len(), 7);
    }
}
