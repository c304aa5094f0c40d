//! Prize fund split per place
//!
//! Computed splits, in percent of the prize:
//!
//! | winners | places                                       |
//! |---------|----------------------------------------------|
//! | 1       | 100                                          |
//! | 2       | 60, 30                                       |
//! | 3       | 60, 30, 10                                   |
//! | n > 3   | 50, 30, 15, then 5 split evenly over n - 3   |
//!
//! Each share is truncated to the currency's scale and the residue goes to
//! place 1, so the shares always add up to the prize.

use crate::error::{RaffleError, Result};
use ledger_core::Currency;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

/// Decimal places an amount in `currency` may carry
pub fn currency_scale(currency: Currency, winix_scale: u32) -> u32 {
    if currency.is_integral() {
        0
    } else {
        winix_scale
    }
}

fn truncate(amount: Decimal, scale: u32) -> Decimal {
    amount.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

fn percentages(winners: u32) -> Vec<Decimal> {
    let pct = |value: u32| Decimal::from(value);
    match winners {
        0 => Vec::new(),
        1 => vec![pct(100)],
        2 => vec![pct(60), pct(30)],
        3 => vec![pct(60), pct(30), pct(10)],
        n => {
            let rest = n - 3;
            let each = pct(5) / Decimal::from(rest);
            let mut split = vec![pct(50), pct(30), pct(15)];
            split.extend(std::iter::repeat(each).take(rest as usize));
            split
        }
    }
}

/// Split `prize` over `winners` places at `scale` decimal places
pub fn compute_distribution(prize: Decimal, winners: u32, scale: u32) -> BTreeMap<u32, Decimal> {
    let mut shares: BTreeMap<u32, Decimal> = percentages(winners)
        .into_iter()
        .zip(1u32..)
        .map(|(pct, place)| (place, truncate(prize * pct / Decimal::ONE_HUNDRED, scale)))
        .collect();

    let paid: Decimal = shares.values().copied().sum();
    if let Some(first) = shares.get_mut(&1) {
        *first += prize - paid;
    }
    shares
}

/// Check an operator-supplied split
///
/// Places must be exactly `1..=winners`, amounts non-negative and within
/// `scale`, and the total must equal `prize`.
pub fn validate_distribution(
    distribution: &BTreeMap<u32, Decimal>,
    winners: u32,
    prize: Decimal,
    scale: u32,
) -> Result<()> {
    let places: Vec<u32> = distribution.keys().copied().collect();
    let expected: Vec<u32> = (1..=winners).collect();
    if places != expected {
        return Err(RaffleError::Validation(format!(
            "prize distribution must cover places 1..={}, got {:?}",
            winners, places
        )));
    }

    for (place, amount) in distribution {
        if amount.is_sign_negative() {
            return Err(RaffleError::Validation(format!(
                "prize for place {} is negative",
                place
            )));
        }
        if truncate(*amount, scale) != *amount {
            return Err(RaffleError::Validation(format!(
                "prize for place {} has more than {} decimal places",
                place, scale
            )));
        }
    }

    let total: Decimal = distribution.values().copied().sum();
    if total != prize {
        return Err(RaffleError::Validation(format!(
            "prize distribution sums to {}, prize is {}",
            total, prize
        )));
    }
    Ok(())
}

/// Prize per place actually paid when `drawn` winners were drawn
///
/// An explicit split pays its first `drawn` places. A computed split is
/// worked out over the drawn places, so the whole prize is paid.
pub fn payable_shares(
    explicit: &BTreeMap<u32, Decimal>,
    prize: Decimal,
    drawn: u32,
    scale: u32,
) -> BTreeMap<u32, Decimal> {
    if explicit.is_empty() {
        compute_distribution(prize, drawn, scale)
    } else {
        explicit
            .iter()
            .filter(|(place, _)| **place <= drawn)
            .map(|(place, amount)| (*place, *amount))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    #[test]
    fn test_single_winner_takes_all() {
        let shares = compute_distribution(d("100"), 1, 2);
        assert_eq!(shares, BTreeMap::from([(1, d("100"))]));
    }

    #[test]
    fn test_two_winners_residue_to_first() {
        let shares = compute_distribution(d("100"), 2, 2);
        assert_eq!(shares[&1], d("70"));
        assert_eq!(shares[&2], d("30"));
    }

    #[test]
    fn test_three_winners() {
        let shares = compute_distribution(d("1000"), 3, 2);
        assert_eq!(shares.values().copied().collect::<Vec<_>>(), vec![d("600"), d("300"), d("100")]);
    }

    #[test]
    fn test_many_winners_split_the_remainder() {
        let shares = compute_distribution(d("1000"), 5, 2);
        assert_eq!(shares[&1], d("500"));
        assert_eq!(shares[&3], d("150"));
        assert_eq!(shares[&4], d("25"));
        assert_eq!(shares[&5], d("25"));
    }

    #[test]
    fn test_truncation_residue_goes_to_first() {
        // 5% of 10 tickets over 3 places = 0.1666.. -> 0 each
        let shares = compute_distribution(d("10"), 6, 0);
        assert_eq!(shares[&4], Decimal::ZERO);
        assert_eq!(shares.values().copied().sum::<Decimal>(), d("10"));
        assert_eq!(shares[&1], d("6"));
    }

    #[test]
    fn test_explicit_validation() {
        let good = BTreeMap::from([(1, d("80")), (2, d("20"))]);
        assert!(validate_distribution(&good, 2, d("100"), 2).is_ok());

        let gap = BTreeMap::from([(1, d("80")), (3, d("20"))]);
        assert!(validate_distribution(&gap, 2, d("100"), 2).is_err());

        let short = BTreeMap::from([(1, d("80")), (2, d("10"))]);
        assert!(validate_distribution(&short, 2, d("100"), 2).is_err());

        let fractional = BTreeMap::from([(1, d("99.5")), (2, d("0.5"))]);
        assert!(validate_distribution(&fractional, 2, d("100"), 0).is_err());
    }

    #[test]
    fn test_explicit_split_with_fewer_winners() {
        let explicit = BTreeMap::from([(1, d("60")), (2, d("30")), (3, d("10"))]);
        let shares = payable_shares(&explicit, d("100"), 2, 2);
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[&2], d("30"));
    }
}
