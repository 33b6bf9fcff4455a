//! Monthly allowance reset.
//!
//! A reset runs at most once per calendar month. The guard is layered:
//! an in-process mutex serializes runs, the check re-runs under that
//! mutex, and the store rejects a second `completed` event for the same
//! month so concurrent service instances cannot both grant.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::pricing::{PricingError, PricingResolver};
use crate::store::{CreditStore, LedgerEntry, NewResetEvent, StoreError};
use crate::types::{ResetEvent, ResetStatus, TransactionKind, month_start, previous_month, year_month};

pub mod scheduler;

pub use scheduler::{ResetScheduler, SchedulerHandle};

/// Reset type recorded on events and used in the idempotency key.
pub const MONTHLY_RESET: &str = "monthly";

#[derive(Error, Debug)]
pub enum ResetError {
    #[error("reset failed: {message}")]
    Failed { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pricing(#[from] PricingError),
}

pub type ResetResult<T> = std::result::Result<T, ResetError>;

/// What a reset attempt did.
#[derive(Debug, Clone)]
pub struct ResetOutcome {
    /// False when the month was already reset.
    pub performed: bool,
    pub message: String,
    pub users_affected: i64,
    pub total_credits_granted: Decimal,
    pub reset_date: NaiveDate,
    /// Id of the recorded event, when one was written by this attempt.
    pub event_id: Option<i64>,
}

impl ResetOutcome {
    fn skipped(reset_date: NaiveDate, message: impl Into<String>) -> Self {
        Self {
            performed: false,
            message: message.into(),
            users_affected: 0,
            total_credits_granted: Decimal::ZERO,
            reset_date,
            event_id: None,
        }
    }
}

/// Executes and records monthly resets.
pub struct ResetRunner {
    store: Arc<dyn CreditStore>,
    pricing: PricingResolver,
    run_lock: Mutex<()>,
}

impl ResetRunner {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        let pricing = PricingResolver::new(store.clone());
        Self {
            store,
            pricing,
            run_lock: Mutex::new(()),
        }
    }

    /// True when no completed monthly reset exists for the current
    /// calendar month. A fresh system with no reset history needs one.
    pub async fn needs_reset(&self) -> ResetResult<bool> {
        self.needs_reset_at(Utc::now()).await
    }

    pub async fn needs_reset_at(&self, now: DateTime<Utc>) -> ResetResult<bool> {
        let current_month = month_start(now.date_naive());
        match self.store.last_completed_reset(MONTHLY_RESET).await? {
            Some(last) => Ok(month_start(last.reset_date) < current_month),
            None => Ok(true),
        }
    }

    /// Run the monthly reset if the current month has not been reset
    /// yet. Safe to call repeatedly; redundant calls report
    /// `performed: false`.
    pub async fn perform_reset(&self) -> ResetResult<ResetOutcome> {
        self.perform_reset_at(Utc::now()).await
    }

    pub async fn perform_reset_at(&self, now: DateTime<Utc>) -> ResetResult<ResetOutcome> {
        let _guard = self.run_lock.lock().await;
        let today = now.date_naive();

        // Re-check under the lock: another task may have completed the
        // reset while this one waited.
        if !self.needs_reset_at(now).await? {
            return Ok(ResetOutcome::skipped(
                today,
                "monthly reset already performed for this month",
            ));
        }

        // Claim the month before touching any balance. A cross-instance
        // race loser stops here, mutation-free, instead of re-granting
        // over withdrawals made after the winner's reset.
        let event = match self
            .store
            .record_reset_event(NewResetEvent {
                reset_type: MONTHLY_RESET.to_string(),
                reset_date: today,
                users_affected: 0,
                total_credits_granted: Decimal::ZERO,
                status: ResetStatus::Completed,
                error_message: None,
                metadata: Some(json!({ "reset_timestamp": now.to_rfc3339() })),
            })
            .await
        {
            Ok(event) => event,
            Err(StoreError::DuplicateReset { .. }) => {
                info!("monthly reset already recorded by another instance");
                return Ok(ResetOutcome::skipped(
                    today,
                    "monthly reset already performed for this month",
                ));
            }
            Err(err) => return Err(err.into()),
        };

        match self.apply(now).await {
            Ok((users_affected, total_granted)) => {
                self.store
                    .finalize_reset_event(event.id, users_affected, total_granted)
                    .await?;
                info!(
                    users_affected,
                    total_credits_granted = %total_granted,
                    "monthly credit reset completed"
                );
                Ok(ResetOutcome {
                    performed: true,
                    message: format!("monthly reset completed for {users_affected} accounts"),
                    users_affected,
                    total_credits_granted: total_granted,
                    reset_date: today,
                    event_id: Some(event.id),
                })
            }
            Err(err) => {
                // Release the claim so a later attempt can retry the
                // month; overwriting grants is idempotent.
                self.release_claim(event.id, &err).await;
                Err(err)
            }
        }
    }

    async fn apply(&self, now: DateTime<Utc>) -> ResetResult<(i64, Decimal)> {
        let (year, month) = year_month(now);
        let (prev_year, prev_month) = previous_month(year, month);

        let accounts = self.store.list_accounts().await?;
        let mut users_affected = 0i64;
        let mut total_granted = Decimal::ZERO;

        for account in &accounts {
            let allowance = self.pricing.resolve_allowance(&account.id).await?;

            // Archive the closing balance on last month's row, if the
            // account had usage then.
            self.store
                .set_balance_before_reset(&account.id, prev_year, prev_month, account.balance)
                .await?;

            // Overwrite, never add: unspent credits do not roll over.
            self.store
                .set_balance(
                    &account.id,
                    allowance,
                    LedgerEntry::new(
                        TransactionKind::MonthlyReset,
                        "system",
                        format!("Monthly credit reset for {year}-{month:02}"),
                    ),
                )
                .await?;

            self.store
                .ensure_statistics_row(&account.id, year, month)
                .await?;

            users_affected += 1;
            total_granted += allowance;
        }

        Ok((users_affected, total_granted))
    }

    async fn release_claim(&self, event_id: i64, err: &ResetError) {
        if let Err(release_err) = self
            .store
            .fail_reset_event(event_id, &err.to_string())
            .await
        {
            error!(error = %release_err, "could not release failed reset claim");
        }
    }

    pub async fn reset_history(&self, limit: u32) -> ResetResult<Vec<ResetEvent>> {
        Ok(self.store.reset_history(limit).await?)
    }

    pub async fn last_completed(&self) -> ResetResult<Option<ResetEvent>> {
        Ok(self.store.last_completed_reset(MONTHLY_RESET).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::BASELINE_GROUP_ID;
    use crate::store::{MemoryStore, StoreResult, WithdrawRecord};
    use crate::types::{Account, Group, Model, Transaction, UsageStatistic};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store with injectable faults: a stale reset-history view
    /// (as a lagging replica would serve) and failing balance writes.
    struct FaultyStore {
        inner: MemoryStore,
        hide_completed: AtomicBool,
        fail_set_balance: AtomicBool,
    }

    impl FaultyStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                hide_completed: AtomicBool::new(false),
                fail_set_balance: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CreditStore for FaultyStore {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
            self.inner.get_account(id).await
        }

        async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
            self.inner.list_accounts().await
        }

        async fn set_balance(
            &self,
            id: &str,
            new_balance: Decimal,
            entry: LedgerEntry,
        ) -> StoreResult<Transaction> {
            if self.fail_set_balance.load(Ordering::SeqCst) {
                return Err(StoreError::Backend {
                    message: "write unavailable".to_string(),
                });
            }
            self.inner.set_balance(id, new_balance, entry).await
        }

        async fn withdraw(
            &self,
            id: &str,
            amount: Decimal,
            entry: LedgerEntry,
        ) -> StoreResult<WithdrawRecord> {
            self.inner.withdraw(id, amount, entry).await
        }

        async fn upsert_group(&self, group: &Group) -> StoreResult<()> {
            self.inner.upsert_group(group).await
        }

        async fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
            self.inner.get_group(id).await
        }

        async fn list_groups(&self) -> StoreResult<Vec<Group>> {
            self.inner.list_groups().await
        }

        async fn replace_memberships(
            &self,
            account_id: &str,
            group_ids: &[String],
        ) -> StoreResult<()> {
            self.inner.replace_memberships(account_id, group_ids).await
        }

        async fn memberships(&self, account_id: &str) -> StoreResult<Vec<String>> {
            self.inner.memberships(account_id).await
        }

        async fn upsert_model(&self, model: &Model) -> StoreResult<()> {
            self.inner.upsert_model(model).await
        }

        async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
            self.inner.get_model(id).await
        }

        async fn list_models(&self) -> StoreResult<Vec<Model>> {
            self.inner.list_models().await
        }

        async fn list_transactions(
            &self,
            account_id: Option<&str>,
            limit: u32,
            offset: u32,
        ) -> StoreResult<Vec<Transaction>> {
            self.inner.list_transactions(account_id, limit, offset).await
        }

        async fn record_usage(
            &self,
            account_id: &str,
            year: i32,
            month: u32,
            credits: Decimal,
            model_id: Option<&str>,
        ) -> StoreResult<()> {
            self.inner
                .record_usage(account_id, year, month, credits, model_id)
                .await
        }

        async fn account_statistics(
            &self,
            account_id: &str,
            limit: u32,
        ) -> StoreResult<Vec<UsageStatistic>> {
            self.inner.account_statistics(account_id, limit).await
        }

        async fn statistics_for_month(
            &self,
            year: i32,
            month: u32,
        ) -> StoreResult<Vec<UsageStatistic>> {
            self.inner.statistics_for_month(year, month).await
        }

        async fn statistics_for_year(&self, year: i32) -> StoreResult<Vec<UsageStatistic>> {
            self.inner.statistics_for_year(year).await
        }

        async fn set_balance_before_reset(
            &self,
            account_id: &str,
            year: i32,
            month: u32,
            balance: Decimal,
        ) -> StoreResult<bool> {
            self.inner
                .set_balance_before_reset(account_id, year, month, balance)
                .await
        }

        async fn ensure_statistics_row(
            &self,
            account_id: &str,
            year: i32,
            month: u32,
        ) -> StoreResult<bool> {
            self.inner.ensure_statistics_row(account_id, year, month).await
        }

        async fn record_reset_event(&self, event: NewResetEvent) -> StoreResult<ResetEvent> {
            self.inner.record_reset_event(event).await
        }

        async fn finalize_reset_event(
            &self,
            id: i64,
            users_affected: i64,
            total_credits_granted: Decimal,
        ) -> StoreResult<()> {
            self.inner
                .finalize_reset_event(id, users_affected, total_credits_granted)
                .await
        }

        async fn fail_reset_event(&self, id: i64, error_message: &str) -> StoreResult<()> {
            self.inner.fail_reset_event(id, error_message).await
        }

        async fn last_completed_reset(&self, reset_type: &str) -> StoreResult<Option<ResetEvent>> {
            if self.hide_completed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.last_completed_reset(reset_type).await
        }

        async fn reset_history(&self, limit: u32) -> StoreResult<Vec<ResetEvent>> {
            self.inner.reset_history(limit).await
        }

        async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get_setting(key).await
        }

        async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
            self.inner.set_setting(key, value).await
        }
    }

    async fn seeded() -> (Arc<ResetRunner>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_group(&Group::baseline(BASELINE_GROUP_ID, "Users", dec!(100)))
            .await
            .unwrap();
        store
            .upsert_group(&Group::new("power", "Power users", dec!(200)))
            .await
            .unwrap();
        (Arc::new(ResetRunner::new(store.clone())), store)
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 3, 0, 0).unwrap()
    }

    async fn seed_account(store: &MemoryStore, id: &str, balance: Decimal) {
        store
            .set_balance(
                id,
                balance,
                LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "seed"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_system_needs_reset() {
        let (runner, _) = seeded().await;
        assert!(runner.needs_reset_at(at(2025, 8, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn reset_overwrites_balance_with_allowance() {
        let (runner, store) = seeded().await;
        seed_account(&store, "alice", dec!(50)).await;
        store
            .replace_memberships("alice", &["power".to_string()])
            .await
            .unwrap();

        let outcome = runner.perform_reset_at(at(2025, 8, 1)).await.unwrap();
        assert!(outcome.performed);
        assert_eq!(outcome.users_affected, 1);
        assert_eq!(outcome.total_credits_granted, dec!(300));

        // 50 unspent credits are gone, not added to the allowance.
        let account = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(300));

        let last = store.last_completed_reset(MONTHLY_RESET).await.unwrap();
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn second_reset_in_same_month_is_skipped() {
        let (runner, store) = seeded().await;
        seed_account(&store, "alice", dec!(0)).await;

        let first = runner.perform_reset_at(at(2025, 8, 1)).await.unwrap();
        assert!(first.performed);

        // Spend some credits mid-month.
        store
            .withdraw(
                "alice",
                dec!(30),
                LedgerEntry::new(TransactionKind::Deduct, "system", "usage"),
            )
            .await
            .unwrap();

        let second = runner.perform_reset_at(at(2025, 8, 20)).await.unwrap();
        assert!(!second.performed);
        let account = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(70));

        // A new month is due again.
        assert!(runner.needs_reset_at(at(2025, 9, 1)).await.unwrap());
        let third = runner.perform_reset_at(at(2025, 9, 1)).await.unwrap();
        assert!(third.performed);
    }

    #[tokio::test]
    async fn previous_month_balance_is_archived() {
        let (runner, store) = seeded().await;
        seed_account(&store, "alice", dec!(100)).await;

        // July usage creates the row the August reset archives into.
        store
            .record_usage("alice", 2025, 7, dec!(40), Some("m"))
            .await
            .unwrap();
        store
            .withdraw(
                "alice",
                dec!(40),
                LedgerEntry::new(TransactionKind::Deduct, "system", "usage"),
            )
            .await
            .unwrap();

        runner.perform_reset_at(at(2025, 8, 1)).await.unwrap();

        let july = store
            .statistics_for_month(2025, 7)
            .await
            .unwrap()
            .into_iter()
            .find(|row| row.account_id == "alice")
            .unwrap();
        assert_eq!(july.balance_before_reset, Some(dec!(60)));

        // The new month got a zeroed row.
        let august = store.statistics_for_month(2025, 8).await.unwrap();
        assert!(august.iter().any(|row| row.account_id == "alice"));
    }

    #[tokio::test]
    async fn concurrent_resets_produce_one_completed_event() {
        let (runner, store) = seeded().await;
        seed_account(&store, "alice", dec!(10)).await;

        let now = at(2025, 8, 1);
        let a = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.perform_reset_at(now).await })
        };
        let b = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.perform_reset_at(now).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(
            [a.performed, b.performed].iter().filter(|p| **p).count(),
            1
        );

        let completed = store
            .reset_history(10)
            .await
            .unwrap()
            .into_iter()
            .filter(|event| event.status == ResetStatus::Completed)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn race_loser_with_stale_view_mutates_nothing() {
        // Another instance already reset August, and alice has since
        // spent 40 of her 100 grant.
        let inner = MemoryStore::new();
        inner
            .upsert_group(&Group::baseline(BASELINE_GROUP_ID, "Users", dec!(100)))
            .await
            .unwrap();
        inner
            .set_balance(
                "alice",
                dec!(100),
                LedgerEntry::new(TransactionKind::MonthlyReset, "system", "grant"),
            )
            .await
            .unwrap();
        inner
            .withdraw(
                "alice",
                dec!(40),
                LedgerEntry::new(TransactionKind::Deduct, "system", "usage"),
            )
            .await
            .unwrap();
        inner
            .record_reset_event(NewResetEvent {
                reset_type: MONTHLY_RESET.to_string(),
                reset_date: chrono::NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
                users_affected: 1,
                total_credits_granted: dec!(100),
                status: ResetStatus::Completed,
                error_message: None,
                metadata: None,
            })
            .await
            .unwrap();

        // This instance reads reset history through a lagging view and
        // believes the month is still open.
        let store = Arc::new(FaultyStore::new(inner));
        store.hide_completed.store(true, Ordering::SeqCst);
        let runner = ResetRunner::new(store.clone());

        let outcome = runner.perform_reset_at(at(2025, 8, 2)).await.unwrap();
        assert!(!outcome.performed);

        // The loser stopped at the claim: no re-grant clobbered the
        // withdrawal, and no new transactions were written.
        let account = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(60));
        let txns = store.list_transactions(Some("alice"), 10, 0).await.unwrap();
        assert_eq!(txns.len(), 2);
    }

    #[tokio::test]
    async fn failed_reset_releases_the_claim_for_retry() {
        let inner = MemoryStore::new();
        inner
            .upsert_group(&Group::baseline(BASELINE_GROUP_ID, "Users", dec!(100)))
            .await
            .unwrap();
        inner
            .set_balance(
                "alice",
                dec!(5),
                LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "seed"),
            )
            .await
            .unwrap();

        let store = Arc::new(FaultyStore::new(inner));
        store.fail_set_balance.store(true, Ordering::SeqCst);
        let runner = ResetRunner::new(store.clone());

        runner.perform_reset_at(at(2025, 8, 1)).await.unwrap_err();

        // The claim was flipped to failed, so the month is open again.
        let history = store.reset_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ResetStatus::Failed);
        assert!(history[0].error_message.is_some());
        assert!(runner.needs_reset_at(at(2025, 8, 2)).await.unwrap());

        // Once writes recover the retry completes.
        store.fail_set_balance.store(false, Ordering::SeqCst);
        let outcome = runner.perform_reset_at(at(2025, 8, 2)).await.unwrap();
        assert!(outcome.performed);
        let account = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(100));
    }

    #[tokio::test]
    async fn needs_reset_uses_calendar_months_not_elapsed_time() {
        let (runner, store) = seeded().await;
        seed_account(&store, "alice", dec!(0)).await;

        // Reset on the last day of August.
        runner.perform_reset_at(at(2025, 8, 31)).await.unwrap();

        // One day later it is September: due again.
        assert!(runner.needs_reset_at(at(2025, 9, 1)).await.unwrap());
        // 29 days after an Aug 1 reset would still be August: not due.
        assert!(!runner.needs_reset_at(at(2025, 8, 31)).await.unwrap());
    }
}
