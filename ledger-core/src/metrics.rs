//! Metrics collection for observability
//!
//! Prometheus metrics for the ledger, registered on a per-instance registry.
//!
//! # Metrics
//!
//! - `ledger_transactions_applied_total` - Records that reached COMPLETED
//! - `ledger_transactions_rejected_total` - Records that reached FAILED
//! - `ledger_transactions_replayed_total` - Calls answered from a terminal record
//! - `ledger_store_retries_total` - Retries after transient store errors
//! - `ledger_apply_duration_seconds` - Histogram of apply latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Records completed
    pub applied_total: IntCounter,

    /// Records rejected
    pub rejected_total: IntCounter,

    /// Idempotent replays
    pub replayed_total: IntCounter,

    /// Store retries
    pub store_retries: IntCounter,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let applied_total = IntCounter::new(
            "ledger_transactions_applied_total",
            "Transactions applied to a balance",
        )?;
        registry.register(Box::new(applied_total.clone()))?;

        let rejected_total = IntCounter::new(
            "ledger_transactions_rejected_total",
            "Transactions rejected for insufficient funds",
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let replayed_total = IntCounter::new(
            "ledger_transactions_replayed_total",
            "Apply calls answered from an existing terminal record",
        )?;
        registry.register(Box::new(replayed_total.clone()))?;

        let store_retries = IntCounter::new(
            "ledger_store_retries_total",
            "Retries after transient store errors",
        )?;
        registry.register(Box::new(store_retries.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_apply_duration_seconds",
                "Histogram of apply latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        Ok(Self {
            applied_total,
            rejected_total,
            replayed_total,
            store_retries,
            apply_duration,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
