//! Monthly usage aggregation.
//!
//! Statistics are advisory. Writers treat failures here as
//! non-fatal: a charge must never be rolled back because its usage row
//! could not be updated.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::store::{CreditStore, StoreResult};
use crate::types::{MonthlySummary, UsageStatistic, YearlySummary, year_month};

/// Read/write service over per-account, per-month usage rows.
#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn CreditStore>,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Fold one charge into the current month's row.
    pub async fn record_usage(
        &self,
        account_id: &str,
        credits: Decimal,
        model_id: Option<&str>,
    ) -> StoreResult<()> {
        self.record_usage_at(account_id, credits, model_id, Utc::now())
            .await
    }

    /// Like [`record_usage`](Self::record_usage) with an explicit clock.
    pub async fn record_usage_at(
        &self,
        account_id: &str,
        credits: Decimal,
        model_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (year, month) = year_month(now);
        self.store
            .record_usage(account_id, year, month, credits, model_id)
            .await
    }

    /// Most recent months for one account, newest first.
    pub async fn account_history(
        &self,
        account_id: &str,
        months: u32,
    ) -> StoreResult<Vec<UsageStatistic>> {
        self.store.account_statistics(account_id, months).await
    }

    /// Cross-account totals for one month. `None` when no account has a
    /// row for it.
    pub async fn monthly_summary(
        &self,
        year: i32,
        month: u32,
    ) -> StoreResult<Option<MonthlySummary>> {
        let rows = self.store.statistics_for_month(year, month).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut summary = MonthlySummary {
            year,
            month,
            total_credits_used: Decimal::ZERO,
            total_transactions: 0,
            unique_accounts: 0,
            unique_models: 0,
        };
        let mut accounts = BTreeSet::new();
        let mut models = BTreeSet::new();
        for row in &rows {
            summary.total_credits_used += row.credits_used;
            summary.total_transactions += row.transactions_count;
            accounts.insert(row.account_id.clone());
            models.extend(row.models_used.iter().cloned());
        }
        summary.unique_accounts = accounts.len();
        summary.unique_models = models.len();
        Ok(Some(summary))
    }

    /// Cross-account totals for one year.
    pub async fn yearly_summary(&self, year: i32) -> StoreResult<Option<YearlySummary>> {
        let rows = self.store.statistics_for_year(year).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut summary = YearlySummary {
            year,
            total_credits_used: Decimal::ZERO,
            total_transactions: 0,
            unique_accounts: 0,
            unique_models: 0,
        };
        let mut accounts = BTreeSet::new();
        let mut models = BTreeSet::new();
        for row in &rows {
            summary.total_credits_used += row.credits_used;
            summary.total_transactions += row.transactions_count;
            accounts.insert(row.account_id.clone());
            models.extend(row.models_used.iter().cloned());
        }
        summary.unique_accounts = accounts.len();
        summary.unique_models = models.len();
        Ok(Some(summary))
    }

    /// Current-month usage for an account; a zero row when nothing has
    /// been recorded yet this month.
    pub async fn pending_usage(&self, account_id: &str) -> StoreResult<UsageStatistic> {
        self.pending_usage_at(account_id, Utc::now()).await
    }

    pub async fn pending_usage_at(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageStatistic> {
        let (year, month) = year_month(now);
        let rows = self.store.statistics_for_month(year, month).await?;
        Ok(rows
            .into_iter()
            .find(|row| row.account_id == account_id)
            .unwrap_or_else(|| UsageStatistic::empty(account_id, year, month)))
    }
}
