//! Prometheus metrics for the raffle engine, on a per-instance registry
//!
//! - `raffle_entries_total` - Entries bought
//! - `raffle_finalized_total` - Raffles completed
//! - `raffle_cancelled_total` - Raffles cancelled
//! - `raffle_payouts_total` - Prize payouts applied
//! - `raffle_compensations_total` - Entry fees refunded after a failed registration

use prometheus::{IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct RaffleMetrics {
    /// Entries bought
    pub entries_total: IntCounter,

    /// Raffles completed
    pub finalized_total: IntCounter,

    /// Raffles cancelled
    pub cancelled_total: IntCounter,

    /// Payouts applied
    pub payouts_total: IntCounter,

    /// Compensating refunds
    pub compensations_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl RaffleMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let entries_total = counter("raffle_entries_total", "Raffle entries bought")?;
        let finalized_total = counter("raffle_finalized_total", "Raffles completed")?;
        let cancelled_total = counter("raffle_cancelled_total", "Raffles cancelled")?;
        let payouts_total = counter("raffle_payouts_total", "Prize payouts applied")?;
        let compensations_total = counter(
            "raffle_compensations_total",
            "Entry fees refunded after a failed registration",
        )?;

        Ok(Self {
            entries_total,
            finalized_total,
            cancelled_total,
            payouts_total,
            compensations_total,
            registry,
        })
    }

    /// Get registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_collide() {
        let first = RaffleMetrics::new().unwrap();
        let second = RaffleMetrics::new().unwrap();
        first.entries_total.inc_by(3);

        assert_eq!(second.entries_total.get(), 0);
        assert_eq!(first.registry().gather().len(), 5);
    }
}
