//! Weighted winner selection
//!
//! Every entry is one ticket in the pool. A draw picks a uniform ticket, the
//! owner takes the next place, and all of the owner's tickets leave the pool
//! before the next draw. A user therefore wins at most one place.

use ledger_core::UserId;
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use std::fmt;

/// Uniform integer source for draws
pub trait RandomSource: Send + Sync + fmt::Debug {
    /// Uniform value in `0..bound` (`bound > 0`)
    fn below(&self, bound: u64) -> u64;
}

/// Operating-system CSPRNG; the production source
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn below(&self, bound: u64) -> u64 {
        OsRng.gen_range(0..bound)
    }
}

/// Reproducible source for simulations and tests
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Seed the generator
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, bound: u64) -> u64 {
        self.rng.lock().gen_range(0..bound)
    }
}

/// One user's weight in the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Owner
    pub user_id: UserId,
    /// Entries held
    pub weight: u64,
}

/// Draw up to `places` distinct users, in place order
///
/// Zero-weight tickets never win. Fewer users than places yields one place
/// per user.
pub fn draw_winners(pool: &[Ticket], places: usize, random: &dyn RandomSource) -> Vec<UserId> {
    let mut remaining: Vec<&Ticket> = pool.iter().filter(|t| t.weight > 0).collect();
    let mut total: u64 = remaining.iter().map(|t| t.weight).sum();
    let mut drawn = Vec::with_capacity(places.min(remaining.len()));

    while drawn.len() < places && total > 0 {
        let mut pick = random.below(total);
        let index = remaining
            .iter()
            .position(|t| {
                if pick < t.weight {
                    true
                } else {
                    pick -= t.weight;
                    false
                }
            })
            .unwrap_or(remaining.len() - 1);

        let winner = remaining.remove(index);
        total -= winner.weight;
        drawn.push(winner.user_id.clone());
    }

    drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool(weights: &[(&str, u64)]) -> Vec<Ticket> {
        weights
            .iter()
            .map(|(user, weight)| Ticket {
                user_id: UserId::new(*user),
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_no_user_wins_twice() {
        let random = SeededRandom::new(7);
        let tickets = pool(&[("a", 50), ("b", 1), ("c", 1)]);

        for _ in 0..200 {
            let winners = draw_winners(&tickets, 3, &random);
            let distinct: HashSet<_> = winners.iter().collect();
            assert_eq!(winners.len(), 3);
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_places_capped_by_users() {
        let random = SeededRandom::new(1);
        let winners = draw_winners(&pool(&[("a", 3), ("b", 0)]), 5, &random);
        assert_eq!(winners, vec![UserId::new("a")]);
    }

    #[test]
    fn test_empty_pool() {
        assert!(draw_winners(&[], 3, &OsRandom).is_empty());
    }

    #[test]
    fn test_weight_drives_frequency() {
        let random = SeededRandom::new(42);
        let tickets = pool(&[("heavy", 10), ("light", 1)]);
        let trials = 10_000;

        let heavy_wins = (0..trials)
            .filter(|_| draw_winners(&tickets, 1, &random)[0] == UserId::new("heavy"))
            .count();

        // Expected 10/11 ~ 0.909
        let rate = heavy_wins as f64 / trials as f64;
        assert!((0.88..0.94).contains(&rate), "heavy win rate {}", rate);
    }

    #[test]
    fn test_os_random_stays_in_bounds() {
        for bound in [1u64, 2, 17, u64::MAX] {
            assert!(OsRandom.below(bound) < bound);
        }
    }
}
