//! End-to-end flows over the in-memory store: charging, the monthly
//! reset cycle, ledger/statistics consistency, and the scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use credit_ledger::pricing::BASELINE_GROUP_ID;
use credit_ledger::reset::{ResetRunner, ResetScheduler};
use credit_ledger::store::CreditStore;
use credit_ledger::{
    CreditManager, Group, MemoryStore, Model, TransactionKind,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("credit_ledger=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
}

async fn platform() -> (CreditManager, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_group(&Group::baseline(BASELINE_GROUP_ID, "Users", dec!(1000)))
        .await
        .unwrap();
    store
        .upsert_group(&Group::new("research", "Research", dec!(4000)))
        .await
        .unwrap();
    store
        .upsert_model(&Model::new("large", "Large", dec!(0.001), dec!(0.004)))
        .await
        .unwrap();
    store
        .upsert_model(&Model::new("small", "Small", dec!(0.0001), dec!(0.0004)).free())
        .await
        .unwrap();
    (CreditManager::new(store.clone()), store)
}

#[tokio::test]
async fn month_of_usage_then_reset() {
    let (manager, store) = platform().await;
    store
        .replace_memberships("alice", &["research".to_string()])
        .await
        .unwrap();

    // August starts with a reset granting the allowances.
    let runner = manager.reset_runner();
    let outcome = runner.perform_reset_at(at(2025, 8, 1)).await.unwrap();
    assert!(outcome.performed);

    // Alice does not exist yet at reset time; a charge creates her at
    // zero, so seed her like the importer would.
    manager
        .set_balance("alice", dec!(5000), "sync", "Initial allocation")
        .await
        .unwrap();

    let receipt = manager
        .charge_tokens_at("alice", "large", 100_000, 20_000, "gateway", at(2025, 8, 5))
        .await
        .unwrap();
    assert_eq!(receipt.cost, dec!(180)); // 100 + 80
    assert_eq!(receipt.new_balance, dec!(4820));

    manager
        .charge_tokens_at("alice", "small", 50_000, 10_000, "gateway", at(2025, 8, 6))
        .await
        .unwrap();

    let history = manager.account_usage_history("alice", 12).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].credits_used, dec!(180));
    assert_eq!(history[0].transactions_count, 2);
    assert_eq!(history[0].models_used.len(), 2);

    // September: the reset overwrites the balance with the allowance.
    let outcome = runner.perform_reset_at(at(2025, 9, 1)).await.unwrap();
    assert!(outcome.performed);
    let overview = manager.account_overview("alice").await.unwrap();
    assert_eq!(overview.balance, dec!(5000)); // 1000 baseline + 4000 research
    assert_eq!(overview.allowance, dec!(5000));

    // The August row archived the closing balance.
    let august = manager
        .account_usage_history("alice", 12)
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.month == 8)
        .unwrap();
    assert_eq!(august.balance_before_reset, Some(dec!(4820)));
}

#[tokio::test]
async fn statistics_match_the_transaction_log() {
    let (manager, store) = platform().await;
    for (account, prompt, completion) in [
        ("alice", 10_000i64, 2_000i64),
        ("alice", 5_000, 1_000),
        ("bob", 30_000, 0),
    ] {
        manager
            .set_balance(account, dec!(1000), "admin", "seed")
            .await
            .ok();
        manager
            .charge_tokens_at(account, "large", prompt, completion, "gateway", at(2025, 8, 10))
            .await
            .unwrap();
    }

    let deducted: Decimal = store
        .list_transactions(None, 100, 0)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.kind == TransactionKind::Deduct)
        .map(|t| -t.amount)
        .sum();

    let summary = manager.monthly_summary(2025, 8).await.unwrap().unwrap();
    assert_eq!(summary.total_credits_used, deducted);
    assert_eq!(summary.unique_accounts, 2);
    assert_eq!(summary.unique_models, 1);

    let yearly = manager.yearly_summary(2025).await.unwrap().unwrap();
    assert_eq!(yearly.total_credits_used, deducted);
}

#[tokio::test]
async fn concurrent_charges_never_overdraw() {
    let (manager, store) = platform().await;
    let manager = Arc::new(manager);
    manager
        .set_balance("alice", dec!(10), "admin", "seed")
        .await
        .unwrap();

    // 8 concurrent charges of 3.0 against a balance of 10.
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .charge_tokens_at("alice", "large", 1000, 500, "gateway", at(2025, 8, 12))
                .await
        }));
    }

    let mut total_deducted = Decimal::ZERO;
    for task in tasks {
        total_deducted += task.await.unwrap().unwrap().deducted;
    }
    assert_eq!(total_deducted, dec!(10));

    let account = store.get_account("alice").await.unwrap().unwrap();
    assert_eq!(account.balance, Decimal::ZERO);

    // Every transaction's balance_after is consistent with its amount.
    let txns = store.list_transactions(Some("alice"), 100, 0).await.unwrap();
    for pair in txns.windows(2) {
        // Newest first: the older row's balance_after is the newer
        // row's starting balance.
        assert_eq!(pair[1].balance_after + pair[0].amount, pair[0].balance_after);
    }
}

#[tokio::test]
async fn scheduler_performs_due_reset_and_shuts_down() {
    let (manager, store) = platform().await;
    store
        .set_balance(
            "alice",
            dec!(3),
            credit_ledger::LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "seed"),
        )
        .await
        .unwrap();

    let runner: Arc<ResetRunner> = manager.reset_runner();
    let handle = ResetScheduler::new(runner.clone())
        .with_check_interval(Duration::from_millis(50))
        .spawn();

    // The startup tick performs the overdue reset.
    let mut performed = false;
    for _ in 0..50 {
        if runner.last_completed().await.unwrap().is_some() {
            performed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(performed, "scheduler never performed the due reset");

    let account = store.get_account("alice").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(1000));

    handle.shutdown().await;

    // Only one completed event despite repeated ticks.
    let completed = store
        .reset_history(20)
        .await
        .unwrap()
        .into_iter()
        .filter(|event| event.status == credit_ledger::ResetStatus::Completed)
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn manual_reset_is_idempotent_via_facade() {
    let (manager, _) = platform().await;
    manager
        .set_balance("alice", dec!(0), "admin", "seed")
        .await
        .unwrap();

    assert!(manager.needs_reset().await.unwrap());
    let first = manager.perform_reset().await.unwrap();
    assert!(first.performed);
    assert!(!manager.needs_reset().await.unwrap());
    let second = manager.perform_reset().await.unwrap();
    assert!(!second.performed);

    let history = manager.reset_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
}
