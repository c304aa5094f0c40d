//! Background settlement loop
//!
//! Each pass first re-drives PENDING ledger records, then finalizes raffles
//! whose end time has passed and finishes interrupted cancellations.

use crate::config::SchedulerConfig;
use crate::engine::RaffleEngine;
use crate::error::Result;
use crate::types::SettlementReport;
use chrono::{DateTime, Utc};
use ledger_core::{Ledger, ReconcileReport};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Pending ledger records
    pub reconcile: ReconcileReport,
    /// Expired raffles
    pub settlement: SettlementReport,
}

/// Periodic reconciler and finalizer
#[derive(Debug)]
pub struct Scheduler {
    engine: Arc<RaffleEngine>,
    ledger: Arc<Ledger>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create scheduler
    pub fn new(engine: Arc<RaffleEngine>, ledger: Arc<Ledger>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            ledger,
            config,
        }
    }

    /// Run one pass as of `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SchedulerReport> {
        let reconcile = self
            .ledger
            .reconcile_pending(
                chrono::Duration::seconds(self.config.reconcile_after_secs),
                self.config.batch_limit,
            )
            .await?;
        let settlement = self
            .engine
            .finalize_expired(now, self.config.batch_limit)
            .await?;

        debug!(
            reconciled = reconcile.completed,
            finalized = settlement.finalized,
            "Scheduler pass done"
        );
        Ok(SchedulerReport {
            reconcile,
            settlement,
        })
    }

    /// Start the scheduler loop
    pub async fn start(self: Arc<Self>) {
        info!(
            interval_secs = self.config.interval_secs,
            "Starting raffle scheduler"
        );

        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(self.config.interval_secs.max(1)));

        loop {
            interval.tick().await;

            let now = self.ledger.clock().now();
            if let Err(e) = self.run_once(now).await {
                warn!(error = %e, "Scheduler pass failed");
            }
        }
    }
}
