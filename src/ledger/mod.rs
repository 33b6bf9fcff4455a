//! Balance mutations with transaction logging.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use crate::stats::UsageAggregator;
use crate::store::{CreditStore, LedgerEntry, StoreError, WithdrawRecord};
use crate::types::{Account, Transaction};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("amount must not be negative: {amount}")]
    InvalidAmount { amount: Decimal },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// The write path for account balances.
///
/// Every mutation goes through the store's atomic balance+transaction
/// operations; after a positive deduction the monthly usage row is
/// updated best-effort.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn CreditStore>,
    stats: UsageAggregator,
}

impl Ledger {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        let stats = UsageAggregator::new(store.clone());
        Self { store, stats }
    }

    pub async fn account(&self, account_id: &str) -> LedgerResult<Option<Account>> {
        Ok(self.store.get_account(account_id).await?)
    }

    /// Current balance; zero for accounts the ledger has never seen.
    pub async fn balance(&self, account_id: &str) -> LedgerResult<Decimal> {
        Ok(self
            .store
            .get_account(account_id)
            .await?
            .map(|account| account.balance)
            .unwrap_or(Decimal::ZERO))
    }

    /// Overwrite the balance, logging the delta as a transaction.
    pub async fn set_balance(
        &self,
        account_id: &str,
        new_balance: Decimal,
        entry: LedgerEntry,
    ) -> LedgerResult<Transaction> {
        if new_balance < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount {
                amount: new_balance,
            });
        }
        Ok(self.store.set_balance(account_id, new_balance, entry).await?)
    }

    /// Withdraw up to `amount` credits. The deduction is capped at the
    /// current balance and the balance never goes below zero; the
    /// returned record carries what was actually taken.
    pub async fn withdraw(
        &self,
        account_id: &str,
        amount: Decimal,
        entry: LedgerEntry,
    ) -> LedgerResult<WithdrawRecord> {
        self.withdraw_at(account_id, amount, entry, Utc::now()).await
    }

    pub async fn withdraw_at(
        &self,
        account_id: &str,
        amount: Decimal,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> LedgerResult<WithdrawRecord> {
        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount { amount });
        }

        // Stamp the transaction with the same clock the usage row gets,
        // so both always land in the same calendar month.
        let entry = entry.at(now);
        let model_id = entry.model_id.clone();
        let record = self.store.withdraw(account_id, amount, entry).await?;

        // Usage statistics are advisory; a failed update must not
        // surface as a failed charge.
        if record.deducted > Decimal::ZERO {
            if let Err(err) = self
                .stats
                .record_usage_at(account_id, record.deducted, model_id.as_deref(), now)
                .await
            {
                warn!(
                    account_id,
                    error = %err,
                    "failed to update usage statistics after withdrawal"
                );
            }
        }

        Ok(record)
    }

    pub async fn transactions(
        &self,
        account_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> LedgerResult<Vec<Transaction>> {
        Ok(self
            .store
            .list_transactions(account_id, limit, offset)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::TransactionKind;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ledger() -> (Ledger, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Ledger::new(store.clone()), store)
    }

    fn entry() -> LedgerEntry {
        LedgerEntry::new(TransactionKind::Deduct, "system", "test charge")
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let (ledger, _) = ledger();
        let err = ledger
            .withdraw("alice", dec!(-1), entry())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));

        let err = ledger
            .set_balance(
                "alice",
                dec!(-5),
                LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "bad"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn positive_withdrawal_feeds_statistics() {
        let (ledger, store) = ledger();
        ledger
            .set_balance(
                "alice",
                dec!(10),
                LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "seed"),
            )
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 0, 0).unwrap();
        let record = ledger
            .withdraw_at("alice", dec!(4), entry().with_model("gpt-a"), now)
            .await
            .unwrap();
        assert_eq!(record.deducted, dec!(4));
        assert_eq!(record.new_balance, dec!(6));

        let rows = store.statistics_for_month(2025, 8).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credits_used, dec!(4));
        assert!(rows[0].models_used.contains("gpt-a"));
    }

    #[tokio::test]
    async fn zero_deduction_leaves_statistics_untouched() {
        let (ledger, store) = ledger();
        // Never-seen account: withdrawal deducts nothing.
        let now = Utc.with_ymd_and_hms(2025, 8, 15, 9, 0, 0).unwrap();
        let record = ledger
            .withdraw_at("ghost", dec!(4), entry(), now)
            .await
            .unwrap();
        assert_eq!(record.deducted, Decimal::ZERO);
        assert_eq!(record.new_balance, Decimal::ZERO);

        assert!(store.statistics_for_month(2025, 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_and_usage_row_share_the_clock() {
        let (ledger, store) = ledger();
        ledger
            .set_balance(
                "alice",
                dec!(10),
                LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "seed"),
            )
            .await
            .unwrap();

        // A charge injected with a past clock books the transaction and
        // the statistics into that month, not the current one.
        let past = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        let record = ledger
            .withdraw_at("alice", dec!(2), entry().with_model("gpt-a"), past)
            .await
            .unwrap();
        assert_eq!(record.transaction.created_at, past);

        let rows = store.statistics_for_month(2024, 12).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credits_used, dec!(2));
    }

    #[tokio::test]
    async fn balance_defaults_to_zero() {
        let (ledger, _) = ledger();
        assert_eq!(ledger.balance("nobody").await.unwrap(), Decimal::ZERO);
    }
}
