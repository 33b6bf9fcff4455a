//! High-level billing facade.
//!
//! `CreditManager` wires the ledger, pricing, statistics, settings, and
//! reset services over one store and exposes the operations the serving
//! layer calls: charge an inference, inspect an account, run or check
//! the monthly reset.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{Ledger, LedgerError};
use crate::pricing::{PricingError, PricingResolver};
use crate::reset::{ResetError, ResetOutcome, ResetRunner};
use crate::settings::Settings;
use crate::stats::UsageAggregator;
use crate::store::{CreditStore, LedgerEntry, StoreError, WithdrawRecord};
use crate::types::{
    AccountOverview, ChargeReceipt, MonthlySummary, ResetEvent, Transaction, TransactionKind,
    UsageStatistic, YearlySummary,
};

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("account not found: {id}")]
    AccountNotFound { id: String },

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reset(#[from] ResetError),
}

pub type BillingResult<T> = std::result::Result<T, BillingError>;

/// Facade over the credit subsystem.
pub struct CreditManager {
    ledger: Ledger,
    pricing: PricingResolver,
    stats: UsageAggregator,
    settings: Settings,
    reset: Arc<ResetRunner>,
}

impl CreditManager {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            pricing: PricingResolver::new(store.clone()),
            stats: UsageAggregator::new(store.clone()),
            settings: Settings::new(store.clone()),
            reset: Arc::new(ResetRunner::new(store)),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pricing(&self) -> &PricingResolver {
        &self.pricing
    }

    pub fn stats(&self) -> &UsageAggregator {
        &self.stats
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn reset_runner(&self) -> Arc<ResetRunner> {
        self.reset.clone()
    }

    /// Charge an account for one inference call.
    ///
    /// Free models cost nothing and never touch the balance, but the
    /// call still shows up in the month's usage statistics. Paid models
    /// are charged up to the available balance; `deducted < cost` in
    /// the receipt means the account ran dry mid-call.
    ///
    /// `actor` identifies the caller on the transaction row, e.g. the
    /// gateway component or an automation identity.
    pub async fn charge_tokens(
        &self,
        account_id: &str,
        model_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        actor: &str,
    ) -> BillingResult<ChargeReceipt> {
        self.charge_tokens_at(
            account_id,
            model_id,
            prompt_tokens,
            completion_tokens,
            actor,
            Utc::now(),
        )
        .await
    }

    pub async fn charge_tokens_at(
        &self,
        account_id: &str,
        model_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        actor: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<ChargeReceipt> {
        let model = self.pricing.model(model_id).await?;

        if model.is_free {
            if let Err(err) = self
                .stats
                .record_usage_at(account_id, Decimal::ZERO, Some(model_id), now)
                .await
            {
                warn!(account_id, model_id, error = %err, "failed to count free-model usage");
            }
            let balance = self.ledger.balance(account_id).await?;
            return Ok(ChargeReceipt {
                account_id: account_id.to_string(),
                model_id: model_id.to_string(),
                cost: Decimal::ZERO,
                prompt_cost: Decimal::ZERO,
                completion_cost: Decimal::ZERO,
                deducted: Decimal::ZERO,
                new_balance: balance,
            });
        }

        let prompt_cost = Decimal::from(prompt_tokens) * model.context_price;
        let completion_cost = Decimal::from(completion_tokens) * model.generation_price;
        let cost = prompt_cost + completion_cost;

        let entry = LedgerEntry::new(
            TransactionKind::Deduct,
            actor,
            format!(
                "Token usage: {prompt_tokens} prompt + {completion_tokens} completion tokens"
            ),
        )
        .with_model(model_id)
        .with_tokens(prompt_tokens, completion_tokens);

        let record = self.ledger.withdraw_at(account_id, cost, entry, now).await?;
        if record.deducted < cost {
            debug!(
                account_id,
                model_id,
                cost = %cost,
                deducted = %record.deducted,
                "partial charge, balance exhausted"
            );
        }

        Ok(ChargeReceipt {
            account_id: account_id.to_string(),
            model_id: model_id.to_string(),
            cost,
            prompt_cost,
            completion_cost,
            deducted: record.deducted,
            new_balance: record.new_balance,
        })
    }

    /// Withdraw a raw credit amount, e.g. for non-token surcharges.
    pub async fn charge_amount(
        &self,
        account_id: &str,
        amount: Decimal,
        actor: &str,
        reason: &str,
    ) -> BillingResult<WithdrawRecord> {
        let entry = LedgerEntry::new(TransactionKind::Deduct, actor, reason);
        Ok(self.ledger.withdraw(account_id, amount, entry).await?)
    }

    /// Manual admin balance override.
    pub async fn set_balance(
        &self,
        account_id: &str,
        new_balance: Decimal,
        actor: &str,
        reason: &str,
    ) -> BillingResult<Transaction> {
        let entry = LedgerEntry::new(TransactionKind::ManualUpdate, actor, reason);
        Ok(self.ledger.set_balance(account_id, new_balance, entry).await?)
    }

    /// Balance, next-reset allowance, and contributing group names.
    pub async fn account_overview(&self, account_id: &str) -> BillingResult<AccountOverview> {
        let account = self
            .ledger
            .account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound {
                id: account_id.to_string(),
            })?;
        let allowance = self.pricing.resolve_allowance(account_id).await?;
        let group_names = self.pricing.group_names_for(account_id).await?;
        Ok(AccountOverview {
            account_id: account.id,
            balance: account.balance,
            allowance,
            group_names,
        })
    }

    /// Advisory affordability check for an estimated call.
    ///
    /// This is a plain read, not a reservation: between this check and
    /// the charge, other requests may drain the balance, and the charge
    /// will then be partial. Callers gating requests on this accept
    /// that window.
    pub async fn has_sufficient_credit(
        &self,
        account_id: &str,
        model_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> BillingResult<bool> {
        let cost = self
            .pricing
            .cost_for(model_id, prompt_tokens, completion_tokens)
            .await?;
        let balance = self.ledger.balance(account_id).await?;
        Ok(balance >= cost)
    }

    pub async fn list_transactions(
        &self,
        account_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> BillingResult<Vec<Transaction>> {
        Ok(self.ledger.transactions(account_id, limit, offset).await?)
    }

    pub async fn account_usage_history(
        &self,
        account_id: &str,
        months: u32,
    ) -> BillingResult<Vec<UsageStatistic>> {
        Ok(self.stats.account_history(account_id, months).await?)
    }

    pub async fn monthly_summary(
        &self,
        year: i32,
        month: u32,
    ) -> BillingResult<Option<MonthlySummary>> {
        Ok(self.stats.monthly_summary(year, month).await?)
    }

    pub async fn yearly_summary(&self, year: i32) -> BillingResult<Option<YearlySummary>> {
        Ok(self.stats.yearly_summary(year).await?)
    }

    pub async fn needs_reset(&self) -> BillingResult<bool> {
        Ok(self.reset.needs_reset().await?)
    }

    pub async fn perform_reset(&self) -> BillingResult<ResetOutcome> {
        Ok(self.reset.perform_reset().await?)
    }

    pub async fn reset_history(&self, limit: u32) -> BillingResult<Vec<ResetEvent>> {
        Ok(self.reset.reset_history(limit).await?)
    }

    pub async fn get_setting(&self, key: &str) -> BillingResult<Option<String>> {
        Ok(self.settings.get(key).await?)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> BillingResult<()> {
        Ok(self.settings.set(key, value).await?)
    }
}
