//! Raffle engine
//!
//! Runs raffles on top of the ledger. Every balance effect is a ledger record
//! with a deterministic id, so repeating any operation after an unknown
//! outcome is safe:
//!
//! | effect        | id                                              |
//! |---------------|-------------------------------------------------|
//! | entry fee     | `raffle_entry:{raffle}:{user}:{request_id}`     |
//! | compensation  | `refund:{fee id}`                               |
//! | prize payout  | `raffle_payout:{raffle}:{place}`                |
//! | cancel refund | `raffle_refund:{raffle}:{user}`                 |
//!
//! Finalization and cancellation move the raffle into `Finalizing` or
//! `Cancelling` under a lease. Only the lease holder works on the raffle;
//! an expired or released lease lets the next call resume the work.

use crate::config::Config;
use crate::distribution::{currency_scale, payable_shares, validate_distribution};
use crate::draw::{draw_winners, RandomSource, Ticket};
use crate::error::{RaffleError, Result};
use crate::metrics::RaffleMetrics;
use crate::store::{
    EntryRegistration, RaffleFilter, RaffleStore, Registration, StatusChange, StatusChangeResult,
    WinnerFlag,
};
use crate::types::{
    CancellationOutcome, FinalizationOutcome, NewRaffle, Participation, ParticipationOutcome,
    ParticipationStatus, Raffle, RaffleId, RaffleStatus, SettlementReport, WinnerRecord,
};
use chrono::{DateTime, Utc};
use ledger_core::retry::{RetryError, RetryPolicy};
use ledger_core::{
    Clock, Currency, Delta, Ledger, LedgerError, StoreError, StoreResult, TransactionId,
    TransactionKind, TransactionRecord, TransactionStatus, UserId,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REFERENCE_TYPE: &str = "raffle";

/// Result of taking a settlement lease
enum Lease {
    /// This call holds the raffle
    Held(Raffle),
    /// The raffle already reached a terminal status
    Settled(Raffle),
}

/// Raffle lifecycle over a [`Ledger`]
pub struct RaffleEngine {
    ledger: Arc<Ledger>,
    store: Arc<dyn RaffleStore>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    store_timeout: Duration,
    metrics: RaffleMetrics,
    config: Config,
}

impl fmt::Debug for RaffleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaffleEngine")
            .field("service_name", &self.config.service_name)
            .field("random", &self.random)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl RaffleEngine {
    /// Build an engine over `ledger`, sharing its clock and retry policy
    pub fn new(
        ledger: Arc<Ledger>,
        store: Arc<dyn RaffleStore>,
        random: Arc<dyn RandomSource>,
        config: Config,
    ) -> Result<Self> {
        if config.max_entries_per_call == 0 {
            return Err(RaffleError::Config(
                "max_entries_per_call must be positive".to_string(),
            ));
        }
        if config.finalize_lease_secs <= 0 {
            return Err(RaffleError::Config(
                "finalize_lease_secs must be positive".to_string(),
            ));
        }

        let metrics = RaffleMetrics::new()
            .map_err(|e| RaffleError::Config(format!("Failed to register metrics: {}", e)))?;
        let clock = ledger.clock();
        let retry = RetryPolicy::new(ledger.config().retry.clone());
        let store_timeout = Duration::from_millis(ledger.config().store_timeout_ms);

        Ok(Self {
            ledger,
            store,
            random,
            clock,
            retry,
            store_timeout,
            metrics,
            config,
        })
    }

    /// Create an ACTIVE raffle
    pub async fn create_raffle(&self, request: NewRaffle) -> Result<Raffle> {
        self.validate_new(&request)?;

        let raffle = Raffle {
            id: RaffleId::generate(),
            title: request.title.trim().to_string(),
            entry_fee: request.entry_fee,
            entry_currency: request.entry_currency,
            prize_amount: request.prize_amount,
            prize_currency: request.prize_currency,
            start_time: request.start_time,
            end_time: request.end_time,
            winners_count: request.winners_count,
            status: RaffleStatus::Active,
            participants_count: 0,
            total_entries: 0,
            prize_distribution: request.prize_distribution.unwrap_or_default(),
            lease: None,
            created_at: self.clock.now(),
            settled_at: None,
        };

        let stored = self
            .call("insert_raffle", || self.store.insert_raffle(&raffle))
            .await?;

        info!(
            raffle_id = %stored.id,
            entry_fee = %stored.entry_fee,
            entry_currency = %stored.entry_currency,
            prize = %stored.prize_amount,
            prize_currency = %stored.prize_currency,
            winners = stored.winners_count,
            end_time = %stored.end_time,
            "Raffle created"
        );
        Ok(stored)
    }

    /// Buy `entries` entries for `user_id`
    ///
    /// Every call is a new purchase. Use
    /// [`RaffleEngine::participate_with_request_id`] to retry a call whose
    /// outcome is unknown.
    pub async fn participate(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
        entries: u32,
    ) -> Result<ParticipationOutcome> {
        let request_id = Uuid::new_v4().to_string();
        self.participate_with_request_id(raffle_id, user_id, entries, &request_id)
            .await
    }

    /// Buy `entries` entries, charging at most once per `request_id`
    ///
    /// The fee is debited first and the entries registered after. When the
    /// registration cannot be made the fee is refunded and the request fails
    /// for good with [`RaffleError::EntryCompensated`] on any retry. When the
    /// registration outcome cannot be read back the fee is kept and the error
    /// returned; retrying with the same `request_id` settles it.
    pub async fn participate_with_request_id(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
        entries: u32,
        request_id: &str,
    ) -> Result<ParticipationOutcome> {
        if entries == 0 || entries > self.config.max_entries_per_call {
            return Err(RaffleError::Validation(format!(
                "entry count must be between 1 and {}, got {}",
                self.config.max_entries_per_call, entries
            )));
        }
        if user_id.as_str().trim().is_empty() {
            return Err(RaffleError::Validation("user id is empty".to_string()));
        }
        if request_id.trim().is_empty() {
            return Err(RaffleError::Validation("request id is empty".to_string()));
        }

        let raffle = self.load(raffle_id).await?;
        let now = self.clock.now();
        if raffle.status != RaffleStatus::Active {
            return Err(RaffleError::InvalidRaffleState {
                raffle_id: raffle.id,
                status: raffle.status,
            });
        }
        if now < raffle.start_time {
            return Err(RaffleError::RaffleNotStarted {
                raffle_id: raffle.id,
                start_time: raffle.start_time,
            });
        }
        if now >= raffle.end_time {
            return Err(RaffleError::RaffleAlreadyEnded {
                raffle_id: raffle.id,
                end_time: raffle.end_time,
            });
        }

        let fee_id = TransactionId::derived([
            "raffle_entry",
            raffle.id.as_str(),
            user_id.as_str(),
            request_id,
        ]);
        let compensation_id = compensation_id(&fee_id);

        // A refunded request stays refunded
        if let Some(refund) = self.ledger.get_transaction(&compensation_id).await? {
            if matches!(
                refund.status,
                TransactionStatus::Completed | TransactionStatus::Pending
            ) {
                return Err(RaffleError::EntryCompensated(fee_id));
            }
        }

        let amount = raffle.entry_fee * Decimal::from(entries);
        let debit = amount_delta(raffle.entry_currency, -amount)?;
        let record = TransactionRecord::new(
            fee_id.clone(),
            user_id.clone(),
            TransactionKind::RaffleEntryFee,
            debit,
        )
        .with_reference(REFERENCE_TYPE, raffle.id.as_str())
        .with_metadata("entries", entries.to_string())
        .with_metadata("request_id", request_id);

        let fee = self.ledger.apply(record).await?;

        let registration = EntryRegistration {
            raffle_id: raffle.id.clone(),
            user_id: user_id.clone(),
            entries,
            fee_transaction_id: fee_id.clone(),
            now,
        };
        let registered = self
            .call("register_entry", || self.store.register_entry(&registration))
            .await;

        let (participation, new_participant) = match registered {
            Ok(Registration::Registered {
                participation,
                new_participant,
            }) => {
                self.metrics.entries_total.inc_by(u64::from(entries));
                (participation, new_participant)
            }
            Ok(Registration::AlreadyRegistered(participation)) => {
                debug!(
                    raffle_id = %raffle.id,
                    user_id = %user_id,
                    transaction_id = %fee_id,
                    "Entry already registered"
                );
                (participation, false)
            }
            Ok(Registration::Closed(status)) => {
                self.compensate(&raffle, user_id, &fee_id, debit, "raffle closed")
                    .await;
                return Err(RaffleError::InvalidRaffleState {
                    raffle_id: raffle.id,
                    status,
                });
            }
            Ok(Registration::NotFound) => {
                self.compensate(&raffle, user_id, &fee_id, debit, "raffle missing")
                    .await;
                return Err(RaffleError::RaffleNotFound(raffle.id));
            }
            Err(err) => {
                // The write may have landed before the error
                let confirmed = self
                    .call("load_participation", || {
                        self.store.load_participation(&raffle.id, user_id)
                    })
                    .await;
                match confirmed {
                    Ok(Some(participation)) if participation.fee_transactions.contains(&fee_id) => {
                        (participation, false)
                    }
                    Ok(_) => {
                        self.compensate(&raffle, user_id, &fee_id, debit, "registration failed")
                            .await;
                        return Err(err);
                    }
                    Err(read_err) => {
                        // Outcome unknown: keep the fee, the request id retries safely
                        error!(
                            raffle_id = %raffle.id,
                            user_id = %user_id,
                            transaction_id = %fee_id,
                            request_id,
                            error = %read_err,
                            "Entry registration unconfirmed"
                        );
                        return Err(err);
                    }
                }
            }
        };

        info!(
            raffle_id = %raffle.id,
            user_id = %user_id,
            entries,
            total_entries = participation.entry_count,
            transaction_id = %fee_id,
            "Raffle entry registered"
        );

        Ok(ParticipationOutcome {
            raffle_id: raffle.id,
            user_id: user_id.clone(),
            entries_added: entries,
            total_entries: participation.entry_count,
            new_participant,
            fee,
        })
    }

    /// Draw winners and pay prizes; the raffle ends COMPLETED
    ///
    /// Without participants the raffle stays ACTIVE and
    /// [`RaffleError::NoParticipants`] is returned. A failed payout leaves the
    /// raffle `Finalizing`; calling again resumes with the same winners.
    pub async fn finalize(&self, raffle_id: &RaffleId) -> Result<FinalizationOutcome> {
        let raffle = self.load(raffle_id).await?;
        match raffle.status {
            RaffleStatus::Completed => return self.completed_outcome(raffle).await,
            RaffleStatus::Cancelling | RaffleStatus::Cancelled => {
                return Err(RaffleError::InvalidRaffleState {
                    raffle_id: raffle.id,
                    status: raffle.status,
                })
            }
            RaffleStatus::Active | RaffleStatus::Finalizing => {}
        }
        if raffle.status == RaffleStatus::Active && self.clock.now() < raffle.end_time {
            return Err(RaffleError::RaffleNotEnded {
                raffle_id: raffle.id,
                end_time: raffle.end_time,
            });
        }

        let holder = Uuid::new_v4().to_string();
        let raffle = match self
            .take_lease(raffle_id, RaffleStatus::Active, RaffleStatus::Finalizing, &holder)
            .await?
        {
            Lease::Held(raffle) => raffle,
            Lease::Settled(raffle) if raffle.status == RaffleStatus::Completed => {
                return self.completed_outcome(raffle).await
            }
            Lease::Settled(raffle) => {
                return Err(RaffleError::InvalidRaffleState {
                    raffle_id: raffle.id,
                    status: raffle.status,
                })
            }
        };

        // Entries are read only once the lease blocks new registrations
        let participations = self
            .call("participations", || self.store.participations(raffle_id))
            .await?;
        if participations.is_empty() {
            self.release(&raffle, &holder, RaffleStatus::Active).await?;
            warn!(raffle_id = %raffle_id, "Raffle has no participants, left active");
            return Err(RaffleError::NoParticipants(raffle.id));
        }

        let winners = match self.settle_winners(&raffle, &participations, &holder).await {
            Ok(winners) => winners,
            Err(err) => {
                self.release_quietly(&raffle, &holder, RaffleStatus::Finalizing).await;
                return Err(err);
            }
        };

        let total_entries: u64 = participations
            .iter()
            .map(|p| u64::from(p.entry_count))
            .sum();
        self.release(&raffle, &holder, RaffleStatus::Completed).await?;
        self.metrics.finalized_total.inc();

        info!(
            raffle_id = %raffle_id,
            winners = winners.len(),
            participants = participations.len(),
            total_entries,
            "Raffle completed"
        );

        Ok(FinalizationOutcome {
            raffle_id: raffle.id,
            winners,
            participants: participations.len(),
            total_entries,
            already_completed: false,
        })
    }

    /// Refund every entry and end the raffle CANCELLED
    ///
    /// Only an ACTIVE raffle (or one whose cancellation was interrupted) can
    /// be cancelled.
    pub async fn cancel(&self, raffle_id: &RaffleId) -> Result<CancellationOutcome> {
        let raffle = self.load(raffle_id).await?;
        match raffle.status {
            RaffleStatus::Cancelled => return self.cancelled_outcome(raffle).await,
            RaffleStatus::Finalizing | RaffleStatus::Completed => {
                return Err(RaffleError::InvalidRaffleState {
                    raffle_id: raffle.id,
                    status: raffle.status,
                })
            }
            RaffleStatus::Active | RaffleStatus::Cancelling => {}
        }

        let holder = Uuid::new_v4().to_string();
        let raffle = match self
            .take_lease(raffle_id, RaffleStatus::Active, RaffleStatus::Cancelling, &holder)
            .await?
        {
            Lease::Held(raffle) => raffle,
            Lease::Settled(raffle) if raffle.status == RaffleStatus::Cancelled => {
                return self.cancelled_outcome(raffle).await
            }
            Lease::Settled(raffle) => {
                return Err(RaffleError::InvalidRaffleState {
                    raffle_id: raffle.id,
                    status: raffle.status,
                })
            }
        };

        let participations = self
            .call("participations", || self.store.participations(raffle_id))
            .await?;

        for participation in &participations {
            if let Err(err) = self.refund(&raffle, participation).await {
                self.release_quietly(&raffle, &holder, RaffleStatus::Cancelling).await;
                return Err(err);
            }
        }

        self.release(&raffle, &holder, RaffleStatus::Cancelled).await?;
        self.metrics.cancelled_total.inc();

        info!(
            raffle_id = %raffle_id,
            refunded = participations.len(),
            "Raffle cancelled"
        );

        Ok(CancellationOutcome {
            raffle_id: raffle.id,
            refunded: participations.len(),
            already_cancelled: false,
        })
    }

    /// Finalize raffles that ended by `now` and finish interrupted settlements
    ///
    /// Raffles without participants stay active and raffles held by another
    /// worker are skipped; both are counted in the report.
    pub async fn finalize_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<SettlementReport> {
        let expired = RaffleFilter {
            statuses: vec![RaffleStatus::Active, RaffleStatus::Finalizing],
            ended_by: Some(now),
            limit: Some(limit),
            ..RaffleFilter::default()
        };
        let cancelling = RaffleFilter {
            statuses: vec![RaffleStatus::Cancelling],
            limit: Some(limit),
            ..RaffleFilter::default()
        };

        let mut raffles = self
            .call("list_raffles", || self.store.list_raffles(&expired))
            .await?;
        raffles.extend(
            self.call("list_raffles", || self.store.list_raffles(&cancelling))
                .await?,
        );
        raffles.truncate(limit);

        let mut report = SettlementReport {
            scanned: raffles.len(),
            ..SettlementReport::default()
        };

        for raffle in raffles {
            let cancelling = raffle.status == RaffleStatus::Cancelling;
            let result = if cancelling {
                self.cancel(&raffle.id).await.map(drop)
            } else {
                self.finalize(&raffle.id).await.map(drop)
            };

            match result {
                Ok(()) if cancelling => report.cancelled += 1,
                Ok(()) => report.finalized += 1,
                Err(RaffleError::NoParticipants(_)) => report.no_participants += 1,
                Err(RaffleError::ConcurrencyConflict(_)) => report.contended += 1,
                Err(e) => {
                    warn!(
                        raffle_id = %raffle.id,
                        status = %raffle.status,
                        error = %e,
                        "Raffle not settled"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                finalized = report.finalized,
                cancelled = report.cancelled,
                no_participants = report.no_participants,
                contended = report.contended,
                failed = report.failed,
                "Settled expired raffles"
            );
        }
        Ok(report)
    }

    /// Look up a raffle
    pub async fn get_raffle(&self, raffle_id: &RaffleId) -> Result<Raffle> {
        self.load(raffle_id).await
    }

    /// Everyone who entered `raffle_id`
    pub async fn participants(&self, raffle_id: &RaffleId) -> Result<Vec<Participation>> {
        self.load(raffle_id).await?;
        self.call("participations", || self.store.participations(raffle_id))
            .await
    }

    /// One user's entry, if any
    pub async fn user_participation(
        &self,
        raffle_id: &RaffleId,
        user_id: &UserId,
    ) -> Result<Option<Participation>> {
        self.call("load_participation", || {
            self.store.load_participation(raffle_id, user_id)
        })
        .await
    }

    /// Winners by place (empty until drawn)
    pub async fn winners(&self, raffle_id: &RaffleId) -> Result<Vec<WinnerRecord>> {
        self.call("winners", || self.store.winners(raffle_id)).await
    }

    /// Record that the winner of `place` was notified
    pub async fn mark_winner_notified(
        &self,
        raffle_id: &RaffleId,
        place: u32,
    ) -> Result<WinnerRecord> {
        self.call("set_winner_flag", || {
            self.store
                .set_winner_flag(raffle_id, place, WinnerFlag::Notified)
        })
        .await?
        .ok_or_else(|| {
            RaffleError::Validation(format!("raffle {} has no winner in place {}", raffle_id, place))
        })
    }

    /// Raffles still accepting entries, earliest end first
    pub async fn list_active(&self, limit: usize) -> Result<Vec<Raffle>> {
        let filter = RaffleFilter {
            statuses: vec![RaffleStatus::Active],
            ends_after: Some(self.clock.now()),
            limit: Some(limit),
            ..RaffleFilter::default()
        };
        self.call("list_raffles", || self.store.list_raffles(&filter))
            .await
    }

    /// Metrics for this instance
    pub fn metrics(&self) -> &RaffleMetrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn validate_new(&self, request: &NewRaffle) -> Result<()> {
        let winix_scale = self.ledger.config().winix_scale;

        if request.title.trim().is_empty() {
            return Err(RaffleError::Validation("title is empty".to_string()));
        }
        if request.entry_fee <= Decimal::ZERO {
            return Err(RaffleError::Validation("entry fee must be positive".to_string()));
        }
        if request.prize_amount <= Decimal::ZERO {
            return Err(RaffleError::Validation("prize must be positive".to_string()));
        }
        if request.end_time <= request.start_time {
            return Err(RaffleError::Validation(
                "end time must be after start time".to_string(),
            ));
        }
        if request.winners_count == 0 {
            return Err(RaffleError::Validation(
                "at least one winner is required".to_string(),
            ));
        }

        let fee_scale = currency_scale(request.entry_currency, winix_scale);
        if request.entry_fee.normalize().scale() > fee_scale {
            return Err(RaffleError::Validation(format!(
                "entry fee {} has more than {} decimal places",
                request.entry_fee, fee_scale
            )));
        }
        let prize_scale = currency_scale(request.prize_currency, winix_scale);
        if request.prize_amount.normalize().scale() > prize_scale {
            return Err(RaffleError::Validation(format!(
                "prize {} has more than {} decimal places",
                request.prize_amount, prize_scale
            )));
        }

        if let Some(distribution) = &request.prize_distribution {
            validate_distribution(
                distribution,
                request.winners_count,
                request.prize_amount,
                prize_scale,
            )?;
        }
        Ok(())
    }

    async fn load(&self, raffle_id: &RaffleId) -> Result<Raffle> {
        self.call("load_raffle", || self.store.load_raffle(raffle_id))
            .await?
            .ok_or_else(|| RaffleError::RaffleNotFound(raffle_id.clone()))
    }

    /// Move `raffle_id` from `from` (or a resumable `next`) into `next`
    ///
    /// A live lease held elsewhere is waited on once before giving up with
    /// [`RaffleError::ConcurrencyConflict`].
    async fn take_lease(
        &self,
        raffle_id: &RaffleId,
        from: RaffleStatus,
        next: RaffleStatus,
        holder: &str,
    ) -> Result<Lease> {
        for attempt in 0..2 {
            let now = self.clock.now();
            let change = StatusChange {
                expected: vec![from, next],
                next,
                holder: holder.to_string(),
                lease_until: Some(now + chrono::Duration::seconds(self.config.finalize_lease_secs)),
                now,
            };

            match self
                .call("change_status", || self.store.change_status(raffle_id, &change))
                .await?
            {
                StatusChangeResult::Changed(raffle) => {
                    debug!(raffle_id = %raffle_id, status = %next, "Settlement lease taken");
                    return Ok(Lease::Held(raffle));
                }
                StatusChangeResult::NotFound => {
                    return Err(RaffleError::RaffleNotFound(raffle_id.clone()))
                }
                StatusChangeResult::Rejected(raffle) if raffle.status.is_terminal() => {
                    return Ok(Lease::Settled(raffle))
                }
                StatusChangeResult::Rejected(raffle) if raffle.status == next && attempt == 0 => {
                    debug!(raffle_id = %raffle_id, "Settlement lease held elsewhere, waiting");
                    tokio::time::sleep(self.retry.delay_for(0)).await;
                }
                StatusChangeResult::Rejected(raffle) if raffle.status == next => {
                    warn!(raffle_id = %raffle_id, status = %next, "Raffle settled by another worker");
                    return Err(RaffleError::ConcurrencyConflict(raffle.id));
                }
                StatusChangeResult::Rejected(raffle) => {
                    return Err(RaffleError::InvalidRaffleState {
                        raffle_id: raffle.id,
                        status: raffle.status,
                    })
                }
            }
        }
        Err(RaffleError::ConcurrencyConflict(raffle_id.clone()))
    }

    /// Leave the transitional status as `next`, dropping the lease
    ///
    /// A terminal `next` completes the settlement.
    async fn release(&self, raffle: &Raffle, holder: &str, next: RaffleStatus) -> Result<()> {
        let change = StatusChange {
            expected: vec![raffle.status],
            next,
            holder: holder.to_string(),
            lease_until: None,
            now: self.clock.now(),
        };
        match self
            .call("change_status", || self.store.change_status(&raffle.id, &change))
            .await?
        {
            StatusChangeResult::Changed(_) => Ok(()),
            StatusChangeResult::Rejected(current) if current.status == next => Ok(()),
            StatusChangeResult::Rejected(current) => Err(RaffleError::InvalidRaffleState {
                raffle_id: current.id,
                status: current.status,
            }),
            StatusChangeResult::NotFound => Err(RaffleError::RaffleNotFound(raffle.id.clone())),
        }
    }

    /// Release after a failure; the lease expires anyway if this fails
    async fn release_quietly(&self, raffle: &Raffle, holder: &str, next: RaffleStatus) {
        if let Err(e) = self.release(raffle, holder, next).await {
            warn!(raffle_id = %raffle.id, error = %e, "Settlement lease not released");
        }
    }

    /// Draw (or reload) the winners and pay each of them
    async fn settle_winners(
        &self,
        raffle: &Raffle,
        participations: &[Participation],
        holder: &str,
    ) -> Result<Vec<WinnerRecord>> {
        let mut winners = self
            .call("winners", || self.store.winners(&raffle.id))
            .await?;

        if winners.is_empty() {
            let drawn = self.draw(raffle, participations);
            winners = self
                .call("insert_winners", || self.store.insert_winners(&raffle.id, &drawn))
                .await?;
            info!(
                raffle_id = %raffle.id,
                holder,
                winners = winners.len(),
                "Winners drawn"
            );
        } else {
            debug!(raffle_id = %raffle.id, "Resuming with stored winners");
        }

        for winner in &winners {
            self.pay(raffle, winner).await?;
        }

        let won: HashSet<&UserId> = winners.iter().map(|w| &w.user_id).collect();
        for participation in participations {
            if won.contains(&participation.user_id) && participation.status != ParticipationStatus::Won {
                self.call("set_participation_status", || {
                    self.store.set_participation_status(
                        &raffle.id,
                        &participation.user_id,
                        ParticipationStatus::Won,
                    )
                })
                .await?;
            }
        }

        self.call("winners", || self.store.winners(&raffle.id))
            .await
    }

    fn draw(&self, raffle: &Raffle, participations: &[Participation]) -> Vec<WinnerRecord> {
        let mut pool: Vec<Ticket> = participations
            .iter()
            .map(|p| Ticket {
                user_id: p.user_id.clone(),
                weight: u64::from(p.entry_count),
            })
            .collect();
        pool.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let drawn = draw_winners(&pool, raffle.winners_count as usize, self.random.as_ref());
        let scale = currency_scale(raffle.prize_currency, self.ledger.config().winix_scale);
        let shares = payable_shares(
            &raffle.prize_distribution,
            raffle.prize_amount,
            drawn.len() as u32,
            scale,
        );
        let now = self.clock.now();

        drawn
            .into_iter()
            .zip(1u32..)
            .map(|(user_id, place)| WinnerRecord {
                raffle_id: raffle.id.clone(),
                user_id,
                place,
                prize_amount: shares.get(&place).copied().unwrap_or(Decimal::ZERO),
                prize_currency: raffle.prize_currency,
                payout_transaction_id: payout_id(&raffle.id, place),
                reward_claimed: false,
                notified: false,
                created_at: now,
            })
            .collect()
    }

    async fn pay(&self, raffle: &Raffle, winner: &WinnerRecord) -> Result<()> {
        if winner.reward_claimed || winner.prize_amount.is_zero() {
            return Ok(());
        }

        let credit = amount_delta(winner.prize_currency, winner.prize_amount)?;
        let record = TransactionRecord::new(
            winner.payout_transaction_id.clone(),
            winner.user_id.clone(),
            TransactionKind::RafflePayout,
            credit,
        )
        .with_reference(REFERENCE_TYPE, raffle.id.as_str())
        .with_metadata("place", winner.place.to_string());

        let result = self.ledger.apply(record).await?;
        if !result.replayed {
            self.metrics.payouts_total.inc();
        }

        self.call("set_winner_flag", || {
            self.store
                .set_winner_flag(&raffle.id, winner.place, WinnerFlag::RewardClaimed)
        })
        .await?;

        info!(
            raffle_id = %raffle.id,
            user_id = %winner.user_id,
            place = winner.place,
            prize = %winner.prize_amount,
            transaction_id = %result.transaction_id,
            "Prize paid"
        );
        Ok(())
    }

    async fn refund(&self, raffle: &Raffle, participation: &Participation) -> Result<()> {
        if participation.status == ParticipationStatus::Refunded {
            return Ok(());
        }

        let amount = raffle.entry_fee * Decimal::from(participation.entry_count);
        let record = TransactionRecord::new(
            refund_id(&raffle.id, &participation.user_id),
            participation.user_id.clone(),
            TransactionKind::RaffleRefund,
            amount_delta(raffle.entry_currency, amount)?,
        )
        .with_reference(REFERENCE_TYPE, raffle.id.as_str())
        .with_metadata("entries", participation.entry_count.to_string());

        let result = self.ledger.apply(record).await?;
        self.call("set_participation_status", || {
            self.store.set_participation_status(
                &raffle.id,
                &participation.user_id,
                ParticipationStatus::Refunded,
            )
        })
        .await?;

        debug!(
            raffle_id = %raffle.id,
            user_id = %participation.user_id,
            amount = %amount,
            replayed = result.replayed,
            "Entry refunded"
        );
        Ok(())
    }

    /// Return a fee whose entries could not be registered
    async fn compensate(
        &self,
        raffle: &Raffle,
        user_id: &UserId,
        fee_id: &TransactionId,
        debit: Delta,
        reason: &str,
    ) {
        let record = TransactionRecord::new(
            compensation_id(fee_id),
            user_id.clone(),
            TransactionKind::RaffleRefund,
            debit.negate(),
        )
        .with_reference(REFERENCE_TYPE, raffle.id.as_str())
        .with_metadata("compensates", fee_id.as_str())
        .with_metadata("reason", reason);

        match self.ledger.apply(record).await {
            Ok(result) => {
                self.metrics.compensations_total.inc();
                warn!(
                    raffle_id = %raffle.id,
                    user_id = %user_id,
                    transaction_id = %fee_id,
                    reason,
                    replayed = result.replayed,
                    "Entry fee refunded"
                );
            }
            Err(e) => {
                // Left PENDING for reconciliation when the store is down
                error!(
                    raffle_id = %raffle.id,
                    user_id = %user_id,
                    transaction_id = %fee_id,
                    error = %e,
                    "Entry fee refund failed"
                );
            }
        }
    }

    async fn completed_outcome(&self, raffle: Raffle) -> Result<FinalizationOutcome> {
        let winners = self.winners(&raffle.id).await?;
        Ok(FinalizationOutcome {
            participants: raffle.participants_count as usize,
            total_entries: raffle.total_entries,
            raffle_id: raffle.id,
            winners,
            already_completed: true,
        })
    }

    async fn cancelled_outcome(&self, raffle: Raffle) -> Result<CancellationOutcome> {
        let participations = self
            .call("participations", || self.store.participations(&raffle.id))
            .await?;
        let refunded = participations
            .iter()
            .filter(|p| p.status == ParticipationStatus::Refunded)
            .count();
        Ok(CancellationOutcome {
            raffle_id: raffle.id,
            refunded,
            already_cancelled: true,
        })
    }

    async fn call<T, F, Fut>(&self, operation_name: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.retry
            .execute(operation_name, || self.timed(operation_name, operation()))
            .await
            .map_err(|e| match e {
                RetryError::Exhausted {
                    attempts,
                    last_error,
                } => {
                    error!(
                        operation = operation_name,
                        attempts,
                        error = %last_error,
                        "Raffle store unavailable"
                    );
                    RaffleError::StoreUnavailable {
                        attempts,
                        last_error,
                    }
                }
                RetryError::Fatal(e) => RaffleError::Store(e),
            })
    }

    async fn timed<T>(
        &self,
        operation_name: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{} exceeded {}ms",
                operation_name,
                self.store_timeout.as_millis()
            ))),
        }
    }
}

fn amount_delta(currency: Currency, amount: Decimal) -> Result<Delta> {
    Delta::of(currency, amount).ok_or_else(|| {
        RaffleError::Ledger(LedgerError::Validation(format!(
            "{} is not a valid {} amount",
            amount, currency
        )))
    })
}

fn compensation_id(fee_id: &TransactionId) -> TransactionId {
    TransactionId::derived(["refund", fee_id.as_str()])
}

fn payout_id(raffle_id: &RaffleId, place: u32) -> TransactionId {
    let place = place.to_string();
    TransactionId::derived(["raffle_payout", raffle_id.as_str(), place.as_str()])
}

fn refund_id(raffle_id: &RaffleId, user_id: &UserId) -> TransactionId {
    TransactionId::derived(["raffle_refund", raffle_id.as_str(), user_id.as_str()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::SeededRandom;
    use crate::store::{MemoryRaffleStore, RaffleOp};
    use chrono::TimeZone;
    use ledger_core::config::RetryConfig;
    use ledger_core::storage::StoreOp;
    use ledger_core::{AcceptAllUsers, HistoryFilter, ManualClock, MemoryStore};
    use std::collections::BTreeMap;

    struct Fixture {
        engine: RaffleEngine,
        ledger: Arc<Ledger>,
        ledger_store: Arc<MemoryStore>,
        store: Arc<MemoryRaffleStore>,
        clock: Arc<ManualClock>,
    }

    fn ledger_config() -> ledger_core::Config {
        ledger_core::Config {
            store_timeout_ms: 200,
            retry: RetryConfig {
                max_retries: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
                max_conflict_retries: 64,
            },
            ..ledger_core::Config::default()
        }
    }

    fn setup(seed: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let ledger_store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(
            Ledger::new(
                ledger_store.clone(),
                Arc::new(AcceptAllUsers),
                clock.clone(),
                ledger_config(),
            )
            .unwrap(),
        );
        let store = Arc::new(MemoryRaffleStore::new());
        let engine = RaffleEngine::new(
            ledger.clone(),
            store.clone(),
            Arc::new(SeededRandom::new(seed)),
            Config::default(),
        )
        .unwrap();

        Fixture {
            engine,
            ledger,
            ledger_store,
            store,
            clock,
        }
    }

    impl Fixture {
        async fn fund(&self, user: &str, tickets: i64) -> UserId {
            let user_id = UserId::new(user);
            let record = TransactionRecord::new(
                TransactionId::derived(["fund", user]),
                user_id.clone(),
                TransactionKind::AdminAdjustment,
                Delta::tickets(tickets),
            );
            self.ledger.apply(record).await.unwrap();
            user_id
        }

        async fn raffle(&self, prize: i64, winners: u32) -> Raffle {
            let now = self.clock.now();
            let request = NewRaffle::new(
                "Weekly draw",
                Decimal::ONE,
                Decimal::from(prize),
                winners,
                now - chrono::Duration::hours(1),
                now + chrono::Duration::hours(1),
            );
            self.engine.create_raffle(request).await.unwrap()
        }

        fn end(&self) {
            self.clock.advance(chrono::Duration::hours(2));
        }

        async fn tickets(&self, user: &UserId) -> i64 {
            self.ledger.get_balance(user).await.unwrap().tickets
        }

        async fn winix(&self, user: &UserId) -> Decimal {
            self.ledger.get_balance(user).await.unwrap().winix
        }
    }

    fn outage() -> StoreError {
        StoreError::Unavailable("disk offline".into())
    }

    #[tokio::test]
    async fn test_single_winner_raffle() {
        let fx = setup(3);
        let a = fx.fund("alice", 10).await;
        let b = fx.fund("bob", 10).await;
        let raffle = fx.raffle(100, 1).await;

        let entry = fx.engine.participate(&raffle.id, &a, 5).await.unwrap();
        assert!(entry.new_participant);
        assert_eq!(entry.total_entries, 5);
        fx.engine.participate(&raffle.id, &b, 1).await.unwrap();
        assert_eq!(fx.tickets(&a).await, 5);
        assert_eq!(fx.tickets(&b).await, 9);

        fx.end();
        let outcome = fx.engine.finalize(&raffle.id).await.unwrap();
        assert!(!outcome.already_completed);
        assert_eq!(outcome.participants, 2);
        assert_eq!(outcome.total_entries, 6);
        assert_eq!(outcome.winners.len(), 1);

        let winner = &outcome.winners[0];
        let loser = if winner.user_id == a { &b } else { &a };
        assert!(winner.reward_claimed);
        assert_eq!(winner.prize_amount, Decimal::from(100));
        assert_eq!(fx.winix(&winner.user_id).await, Decimal::from(100));
        assert_eq!(fx.winix(loser).await, Decimal::ZERO);

        let won = fx
            .engine
            .user_participation(&raffle.id, &winner.user_id)
            .await
            .unwrap()
            .unwrap();
        let lost = fx
            .engine
            .user_participation(&raffle.id, loser)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(won.status.code(), "won");
        assert_eq!(lost.status.code(), "participated");

        let stored = fx.engine.get_raffle(&raffle.id).await.unwrap();
        assert_eq!(stored.status, RaffleStatus::Completed);
        assert!(stored.lease.is_none());
        assert!(stored.settled_at.is_some());
        assert_eq!(fx.engine.metrics().payouts_total.get(), 1);
    }

    #[tokio::test]
    async fn test_finalize_twice_pays_once() {
        let fx = setup(5);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.engine.participate(&raffle.id, &a, 2).await.unwrap();
        fx.end();

        let first = fx.engine.finalize(&raffle.id).await.unwrap();
        let second = fx.engine.finalize(&raffle.id).await.unwrap();

        assert!(second.already_completed);
        assert_eq!(first.winners, second.winners);
        assert_eq!(fx.winix(&a).await, Decimal::from(100));
        assert_eq!(fx.engine.metrics().finalized_total.get(), 1);
    }

    #[tokio::test]
    async fn test_entry_rules() {
        let fx = setup(1);
        let a = fx.fund("alice", 3).await;
        let raffle = fx.raffle(100, 1).await;

        let zero = fx.engine.participate(&raffle.id, &a, 0).await;
        assert!(matches!(zero, Err(RaffleError::Validation(_))));

        let too_many = fx.engine.participate(&raffle.id, &a, 101).await;
        assert!(matches!(too_many, Err(RaffleError::Validation(_))));

        let missing = fx
            .engine
            .participate(&RaffleId::new("nope"), &a, 1)
            .await;
        assert!(matches!(missing, Err(RaffleError::RaffleNotFound(_))));

        let broke = fx.engine.participate(&raffle.id, &a, 5).await;
        assert_eq!(broke.unwrap_err().reason_code(), "insufficient_funds");
        assert_eq!(fx.tickets(&a).await, 3);
        assert!(fx
            .engine
            .user_participation(&raffle.id, &a)
            .await
            .unwrap()
            .is_none());

        fx.end();
        let late = fx.engine.participate(&raffle.id, &a, 1).await;
        assert!(matches!(late, Err(RaffleError::RaffleAlreadyEnded { .. })));
    }

    #[tokio::test]
    async fn test_entry_before_start() {
        let fx = setup(1);
        let a = fx.fund("alice", 3).await;
        let now = fx.clock.now();
        let request = NewRaffle::new(
            "Next week",
            Decimal::ONE,
            Decimal::from(10),
            1,
            now + chrono::Duration::days(1),
            now + chrono::Duration::days(2),
        );
        let raffle = fx.engine.create_raffle(request).await.unwrap();

        let early = fx.engine.participate(&raffle.id, &a, 1).await;
        assert!(matches!(early, Err(RaffleError::RaffleNotStarted { .. })));
        assert_eq!(fx.tickets(&a).await, 3);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_raffles() {
        let fx = setup(1);
        let now = fx.clock.now();
        let base = NewRaffle::new(
            "Draw",
            Decimal::ONE,
            Decimal::from(100),
            2,
            now,
            now + chrono::Duration::hours(1),
        );

        let mut fractional_fee = base.clone();
        fractional_fee.entry_fee = "1.5".parse().unwrap();
        let mut no_winners = base.clone();
        no_winners.winners_count = 0;
        let mut backwards = base.clone();
        backwards.end_time = now - chrono::Duration::hours(1);
        let bad_split = base
            .clone()
            .with_distribution(BTreeMap::from([(1, Decimal::from(90)), (2, Decimal::from(5))]));

        for request in [fractional_fee, no_winners, backwards, bad_split] {
            let result = fx.engine.create_raffle(request).await;
            assert!(matches!(result, Err(RaffleError::Validation(_))));
        }
        assert!(fx.engine.list_active(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_entries_accumulate() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;

        fx.engine.participate(&raffle.id, &a, 1).await.unwrap();
        let again = fx.engine.participate(&raffle.id, &a, 2).await.unwrap();

        assert!(!again.new_participant);
        assert_eq!(again.total_entries, 3);
        let stored = fx.engine.get_raffle(&raffle.id).await.unwrap();
        assert_eq!(stored.participants_count, 1);
        assert_eq!(stored.total_entries, 3);
        assert_eq!(fx.tickets(&a).await, 7);
    }

    #[tokio::test]
    async fn test_retried_request_charges_once() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;

        let first = fx
            .engine
            .participate_with_request_id(&raffle.id, &a, 2, "req-1")
            .await
            .unwrap();
        let retry = fx
            .engine
            .participate_with_request_id(&raffle.id, &a, 2, "req-1")
            .await
            .unwrap();

        assert!(!first.fee.replayed);
        assert!(retry.fee.replayed);
        assert_eq!(retry.total_entries, 2);
        assert_eq!(fx.tickets(&a).await, 8);
    }

    #[tokio::test]
    async fn test_lost_registration_ack_counts_once() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.store.lose_next_acks(RaffleOp::RegisterEntry, 1, outage());

        let entry = fx.engine.participate(&raffle.id, &a, 4).await.unwrap();

        assert_eq!(entry.total_entries, 4);
        assert_eq!(fx.tickets(&a).await, 6);
        assert_eq!(fx.engine.metrics().compensations_total.get(), 0);
        let stored = fx.engine.get_raffle(&raffle.id).await.unwrap();
        assert_eq!(stored.total_entries, 4);
    }

    #[tokio::test]
    async fn test_registration_outage_refunds_fee() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.store.fail_next(RaffleOp::RegisterEntry, 4, outage());

        let failed = fx
            .engine
            .participate_with_request_id(&raffle.id, &a, 3, "req-1")
            .await;
        assert!(matches!(failed, Err(RaffleError::StoreUnavailable { .. })));
        assert_eq!(fx.tickets(&a).await, 10);
        assert_eq!(fx.engine.metrics().compensations_total.get(), 1);

        let retry = fx
            .engine
            .participate_with_request_id(&raffle.id, &a, 3, "req-1")
            .await;
        assert!(matches!(retry, Err(RaffleError::EntryCompensated(_))));
        assert_eq!(fx.tickets(&a).await, 10);
        assert!(fx
            .engine
            .user_participation(&raffle.id, &a)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unconfirmed_registration_keeps_fee() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.store.lose_next_acks(RaffleOp::RegisterEntry, 4, outage());
        fx.store.fail_next(RaffleOp::Participation, 4, outage());

        let unknown = fx
            .engine
            .participate_with_request_id(&raffle.id, &a, 4, "req-1")
            .await;
        assert!(matches!(unknown, Err(RaffleError::StoreUnavailable { .. })));
        assert_eq!(fx.tickets(&a).await, 6);
        assert_eq!(fx.engine.metrics().compensations_total.get(), 0);

        let retry = fx
            .engine
            .participate_with_request_id(&raffle.id, &a, 4, "req-1")
            .await
            .unwrap();
        assert!(retry.fee.replayed);
        assert_eq!(retry.total_entries, 4);
        assert_eq!(fx.tickets(&a).await, 6);

        fx.end();
        let outcome = fx.engine.finalize(&raffle.id).await.unwrap();
        assert_eq!(outcome.winners[0].user_id, a);
        assert_eq!(fx.tickets(&a).await, 6);
    }

    #[tokio::test]
    async fn test_no_participants_stays_active() {
        let fx = setup(1);
        let raffle = fx.raffle(100, 1).await;

        let early = fx.engine.finalize(&raffle.id).await;
        assert!(matches!(early, Err(RaffleError::RaffleNotEnded { .. })));

        fx.end();
        let empty = fx.engine.finalize(&raffle.id).await;
        assert!(matches!(empty, Err(RaffleError::NoParticipants(_))));

        let stored = fx.engine.get_raffle(&raffle.id).await.unwrap();
        assert_eq!(stored.status, RaffleStatus::Active);
        assert!(stored.lease.is_none());
        assert!(fx.engine.winners(&raffle.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_refunds_everyone() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let b = fx.fund("bob", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.engine.participate(&raffle.id, &a, 5).await.unwrap();
        fx.engine.participate(&raffle.id, &a, 2).await.unwrap();
        fx.engine.participate(&raffle.id, &b, 1).await.unwrap();

        let outcome = fx.engine.cancel(&raffle.id).await.unwrap();
        assert_eq!(outcome.refunded, 2);
        assert!(!outcome.already_cancelled);
        assert_eq!(fx.tickets(&a).await, 10);
        assert_eq!(fx.tickets(&b).await, 10);

        for participation in fx.engine.participants(&raffle.id).await.unwrap() {
            assert_eq!(participation.status, ParticipationStatus::Refunded);
        }

        let again = fx.engine.cancel(&raffle.id).await.unwrap();
        assert!(again.already_cancelled);
        assert_eq!(again.refunded, 2);
        assert_eq!(fx.tickets(&a).await, 10);

        let refunds = HistoryFilter::all()
            .kind(TransactionKind::RaffleRefund)
            .reference(raffle.id.as_str());
        for participation in fx.engine.participants(&raffle.id).await.unwrap() {
            let records = fx
                .ledger
                .history(&participation.user_id, &refunds)
                .await
                .unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(
                Decimal::from(records[0].amount.tickets),
                raffle.entry_fee * Decimal::from(participation.entry_count)
            );
            assert_eq!(records[0].status, TransactionStatus::Completed);
        }

        let entry = fx.engine.participate(&raffle.id, &a, 1).await;
        assert!(matches!(entry, Err(RaffleError::InvalidRaffleState { .. })));
        fx.end();
        let finalize = fx.engine.finalize(&raffle.id).await;
        assert!(matches!(finalize, Err(RaffleError::InvalidRaffleState { .. })));
        assert_eq!(fx.winix(&a).await + fx.winix(&b).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_completed_raffle_cannot_be_cancelled() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.engine.participate(&raffle.id, &a, 1).await.unwrap();
        fx.end();
        fx.engine.finalize(&raffle.id).await.unwrap();

        let cancel = fx.engine.cancel(&raffle.id).await;
        assert!(matches!(cancel, Err(RaffleError::InvalidRaffleState { .. })));
        assert_eq!(fx.tickets(&a).await, 9);
    }

    #[tokio::test]
    async fn test_interrupted_payout_resumes_with_same_winners() {
        let fx = setup(11);
        let mut users = Vec::new();
        for name in ["alice", "bob", "carol", "dave"] {
            users.push(fx.fund(name, 10).await);
        }
        let raffle = fx.raffle(1000, 3).await;
        for user in &users {
            fx.engine.participate(&raffle.id, user, 2).await.unwrap();
        }
        fx.end();

        fx.ledger_store.fail_next(StoreOp::Commit, 4, outage());
        let failed = fx.engine.finalize(&raffle.id).await;
        assert!(failed.is_err());

        let stuck = fx.engine.get_raffle(&raffle.id).await.unwrap();
        assert_eq!(stuck.status, RaffleStatus::Finalizing);
        let drawn = fx.engine.winners(&raffle.id).await.unwrap();
        assert_eq!(drawn.len(), 3);

        let outcome = fx.engine.finalize(&raffle.id).await.unwrap();
        let places: Vec<_> = outcome.winners.iter().map(|w| &w.user_id).collect();
        let drawn_places: Vec<_> = drawn.iter().map(|w| &w.user_id).collect();
        assert_eq!(places, drawn_places);
        assert!(outcome.winners.iter().all(|w| w.reward_claimed));

        let mut paid = Decimal::ZERO;
        for user in &users {
            paid += fx.winix(user).await;
        }
        assert_eq!(paid, Decimal::from(1000));
        assert_eq!(outcome.winners[0].prize_amount, Decimal::from(600));
    }

    #[tokio::test]
    async fn test_live_lease_blocks_and_expired_lease_resumes() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.engine.participate(&raffle.id, &a, 1).await.unwrap();
        fx.end();

        let now = fx.clock.now();
        let crashed = StatusChange {
            expected: vec![RaffleStatus::Active],
            next: RaffleStatus::Finalizing,
            holder: "crashed-worker".to_string(),
            lease_until: Some(now + chrono::Duration::seconds(120)),
            now,
        };
        fx.store.change_status(&raffle.id, &crashed).await.unwrap();

        let blocked = fx.engine.finalize(&raffle.id).await;
        assert!(matches!(blocked, Err(RaffleError::ConcurrencyConflict(_))));
        assert_eq!(fx.winix(&a).await, Decimal::ZERO);

        fx.clock.advance(chrono::Duration::seconds(121));
        let outcome = fx.engine.finalize(&raffle.id).await.unwrap();
        assert_eq!(outcome.winners[0].user_id, a);
        assert_eq!(fx.winix(&a).await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_concurrent_finalize_pays_once() {
        let fx = setup(9);
        let a = fx.fund("alice", 10).await;
        let b = fx.fund("bob", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.engine.participate(&raffle.id, &a, 3).await.unwrap();
        fx.engine.participate(&raffle.id, &b, 3).await.unwrap();
        fx.end();

        let (first, second) = tokio::join!(
            fx.engine.finalize(&raffle.id),
            fx.engine.finalize(&raffle.id)
        );

        let fresh = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Ok(o) if !o.already_completed))
            .count();
        assert_eq!(fresh, 1);
        for result in [&first, &second] {
            assert!(matches!(
                result,
                Ok(_) | Err(RaffleError::ConcurrencyConflict(_))
            ));
        }
        assert_eq!(fx.winix(&a).await + fx.winix(&b).await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_fewer_users_than_places() {
        let fx = setup(2);
        let a = fx.fund("alice", 10).await;
        let b = fx.fund("bob", 10).await;
        let raffle = fx.raffle(100, 3).await;
        fx.engine.participate(&raffle.id, &a, 1).await.unwrap();
        fx.engine.participate(&raffle.id, &b, 1).await.unwrap();
        fx.end();

        let outcome = fx.engine.finalize(&raffle.id).await.unwrap();
        let amounts: Vec<_> = outcome.winners.iter().map(|w| w.prize_amount).collect();
        assert_eq!(amounts, vec![Decimal::from(70), Decimal::from(30)]);
        assert_ne!(outcome.winners[0].user_id, outcome.winners[1].user_id);
    }

    #[tokio::test]
    async fn test_explicit_distribution_is_paid() {
        let fx = setup(4);
        let a = fx.fund("alice", 10).await;
        let b = fx.fund("bob", 10).await;
        let now = fx.clock.now();
        let split = BTreeMap::from([(1, Decimal::from(80)), (2, Decimal::from(20))]);
        let request = NewRaffle::new(
            "Split",
            Decimal::ONE,
            Decimal::from(100),
            2,
            now,
            now + chrono::Duration::hours(1),
        )
        .with_distribution(split);
        let raffle = fx.engine.create_raffle(request).await.unwrap();
        fx.engine.participate(&raffle.id, &a, 1).await.unwrap();
        fx.engine.participate(&raffle.id, &b, 1).await.unwrap();
        fx.end();

        let outcome = fx.engine.finalize(&raffle.id).await.unwrap();
        assert_eq!(fx.winix(&outcome.winners[0].user_id).await, Decimal::from(80));
        assert_eq!(fx.winix(&outcome.winners[1].user_id).await, Decimal::from(20));
    }

    #[tokio::test]
    async fn test_finalize_expired_pass() {
        let fx = setup(6);
        let a = fx.fund("alice", 10).await;
        let entered = fx.raffle(100, 1).await;
        let empty = fx.raffle(100, 1).await;
        fx.engine.participate(&entered.id, &a, 1).await.unwrap();

        let now = fx.clock.now();
        let later = NewRaffle::new(
            "Later",
            Decimal::ONE,
            Decimal::from(5),
            1,
            now,
            now + chrono::Duration::days(3),
        );
        let running = fx.engine.create_raffle(later).await.unwrap();
        fx.end();

        let report = fx
            .engine
            .finalize_expired(fx.clock.now(), 10)
            .await
            .unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.finalized, 1);
        assert_eq!(report.no_participants, 1);
        assert_eq!(report.failed, 0);

        let active = fx.engine.list_active(10).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, running.id);
        assert_eq!(
            fx.engine.get_raffle(&empty.id).await.unwrap().status,
            RaffleStatus::Active
        );
    }

    #[tokio::test]
    async fn test_mark_winner_notified() {
        let fx = setup(1);
        let a = fx.fund("alice", 10).await;
        let raffle = fx.raffle(100, 1).await;
        fx.engine.participate(&raffle.id, &a, 1).await.unwrap();
        fx.end();
        fx.engine.finalize(&raffle.id).await.unwrap();

        let winner = fx.engine.mark_winner_notified(&raffle.id, 1).await.unwrap();
        assert!(winner.notified);
        assert!(winner.reward_claimed);

        let missing = fx.engine.mark_winner_notified(&raffle.id, 2).await;
        assert!(matches!(missing, Err(RaffleError::Validation(_))));
    }
}
