//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Exactly-once apply: repeated ids change the balance once
//! - No negative balances under concurrent debits and credits
//! - Consistency: balance == Σ(COMPLETED amounts)

use ledger_core::{
    AcceptAllUsers, Config, Delta, HistoryFilter, Ledger, LedgerError, MemoryStore, RetryConfig,
    RocksStore, SystemClock, TransactionId, TransactionKind, TransactionRecord,
    TransactionStatus, UserId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

fn test_config() -> Config {
    Config {
        retry: RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

/// Create in-memory test ledger
fn create_test_ledger() -> Ledger {
    Ledger::new(
        Arc::new(MemoryStore::new()),
        Arc::new(AcceptAllUsers),
        Arc::new(SystemClock),
        test_config(),
    )
    .unwrap()
}

/// Strategy for generating signed single-currency deltas
fn delta_strategy() -> impl Strategy<Value = Delta> {
    prop_oneof![
        (-50i64..100i64)
            .prop_filter("non-zero", |v| *v != 0)
            .prop_map(Delta::tickets),
        (-50i64..100i64)
            .prop_filter("non-zero", |v| *v != 0)
            .prop_map(Delta::flex),
        (-5_000i64..10_000i64)
            .prop_filter("non-zero", |v| *v != 0)
            .prop_map(|cents| Delta::winix(Decimal::new(cents, 2))),
    ]
}

fn record(id: String, user: &str, amount: Delta) -> TransactionRecord {
    let kind = if amount.is_debit() {
        TransactionKind::RaffleEntryFee
    } else {
        TransactionKind::TaskReward
    };
    TransactionRecord::new(TransactionId::new(id), UserId::new(user), kind, amount)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: applying the same id any number of times changes the balance once
    #[test]
    fn prop_exactly_once_apply(credit in 1i64..1_000, repeats in 2usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let user = UserId::new("u1");

            let mut statuses = Vec::new();
            for _ in 0..repeats {
                let result = ledger
                    .apply(record("reward-1".to_string(), "u1", Delta::tickets(credit)))
                    .await
                    .unwrap();
                statuses.push(result.status);
            }

            prop_assert!(statuses.iter().all(|s| *s == TransactionStatus::Completed));
            prop_assert_eq!(ledger.get_balance(&user).await.unwrap().tickets, credit);
            prop_assert_eq!(ledger.metrics().replayed_total.get(), (repeats - 1) as u64);
            Ok(())
        })?;
    }

    /// Property: concurrent mixed traffic never drives a balance negative
    #[test]
    fn prop_no_negative_balances(deltas in prop::collection::vec(delta_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = Arc::new(create_test_ledger());
            let user = UserId::new("u1");

            let mut handles = Vec::new();
            for (i, delta) in deltas.iter().enumerate() {
                let ledger = ledger.clone();
                let delta = *delta;
                handles.push(tokio::spawn(async move {
                    ledger.apply(record(format!("t{}", i), "u1", delta)).await
                }));
            }

            for handle in handles {
                match handle.await.unwrap() {
                    Ok(result) => prop_assert_eq!(result.status, TransactionStatus::Completed),
                    Err(LedgerError::InsufficientFunds { .. }) => {}
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            }

            let balance = ledger.get_balance(&user).await.unwrap();
            prop_assert!(balance.winix >= Decimal::ZERO);
            prop_assert!(balance.tickets >= 0);
            prop_assert!(balance.flex >= 0);

            let report = ledger.verify_consistency(&user).await.unwrap();
            prop_assert!(report.is_consistent());
            Ok(())
        })?;
    }

    /// Property: every record ends terminal and history accounts for each id once
    #[test]
    fn prop_history_is_complete(deltas in prop::collection::vec(delta_strategy(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger();
            let user = UserId::new("u1");

            for (i, delta) in deltas.iter().enumerate() {
                let _ = ledger.apply(record(format!("t{}", i), "u1", *delta)).await;
            }

            let history = ledger.history(&user, &HistoryFilter::all()).await.unwrap();
            prop_assert_eq!(history.len(), deltas.len());
            prop_assert!(history.iter().all(|r| r.status.is_terminal()));

            let completed = ledger
                .history(&user, &HistoryFilter::all().status(TransactionStatus::Completed))
                .await
                .unwrap();
            let failed = ledger
                .history(&user, &HistoryFilter::all().status(TransactionStatus::Failed))
                .await
                .unwrap();
            prop_assert_eq!(completed.len() + failed.len(), deltas.len());
            Ok(())
        })?;
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_rocksdb_ledger_survives_restart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..test_config()
        };
        let user = UserId::new("u1");

        {
            let ledger = Ledger::open(config.clone()).unwrap();
            ledger
                .apply(record("t1".to_string(), "u1", Delta::tickets(10)))
                .await
                .unwrap();
            ledger
                .apply(record("t2".to_string(), "u1", Delta::tickets(-4)))
                .await
                .unwrap();
        }

        let ledger = Ledger::open(config).unwrap();
        assert_eq!(ledger.get_balance(&user).await.unwrap().tickets, 6);

        // Replays survive the restart too
        let replay = ledger
            .apply(record("t1".to_string(), "u1", Delta::tickets(10)))
            .await
            .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.balance.tickets, 10);

        let history = ledger.history(&user, &HistoryFilter::all()).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1"]);
        assert!(ledger.verify_consistency(&user).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_concurrent_debits_on_rocksdb() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let store = Arc::new(RocksStore::open_path(temp_dir.path(), &config).unwrap());
        let ledger = Arc::new(
            Ledger::new(store, Arc::new(AcceptAllUsers), Arc::new(SystemClock), config).unwrap(),
        );
        let user = UserId::new("u1");

        ledger
            .apply(record("seed".to_string(), "u1", Delta::tickets(5)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .apply(record(format!("spend-{}", i), "u1", Delta::tickets(-1)))
                    .await
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 5);
        assert_eq!(ledger.get_balance(&user).await.unwrap().tickets, 0);
    }
}
