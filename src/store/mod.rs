//! Persistence backends for the credit ledger.
//!
//! `CreditStore` is the repository seam: every balance-mutating
//! operation is atomic inside the backend (one lock section in memory,
//! one SQL transaction otherwise), so the balance write and its
//! transaction-log row are never observed apart.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{
    Account, Group, Model, ResetEvent, ResetStatus, Transaction, TransactionKind, UsageStatistic,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("account not found: {id}")]
    AccountNotFound { id: String },

    #[error("a completed {reset_type} reset is already recorded for {month}")]
    DuplicateReset { reset_type: String, month: NaiveDate },

    #[error("storage error: {message}")]
    Backend { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Metadata accompanying a balance mutation; becomes the transaction row.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub kind: TransactionKind,
    pub actor: String,
    pub reason: String,
    pub model_id: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    /// Transaction timestamp; the store uses its own clock when unset.
    /// Callers replaying or backfilling set this so the row lands in
    /// the same month as the matching usage statistics.
    pub timestamp: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn new(kind: TransactionKind, actor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            actor: actor.into(),
            reason: reason.into(),
            model_id: None,
            prompt_tokens: None,
            completion_tokens: None,
            timestamp: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_tokens(mut self, prompt_tokens: i64, completion_tokens: i64) -> Self {
        self.prompt_tokens = Some(prompt_tokens);
        self.completion_tokens = Some(completion_tokens);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Result of a withdrawal, partial or full.
#[derive(Debug, Clone)]
pub struct WithdrawRecord {
    pub deducted: Decimal,
    pub new_balance: Decimal,
    pub transaction: Transaction,
}

/// Reset event to append; the store assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewResetEvent {
    pub reset_type: String,
    pub reset_date: NaiveDate,
    pub users_affected: i64,
    pub total_credits_granted: Decimal,
    pub status: ResetStatus,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Storage backend for accounts, groups, models, the transaction log,
/// usage statistics, reset events, and settings.
///
/// Implementations must not rewrite queries between dialects; each
/// backend owns its SQL. All methods keyed on ids must behave the same
/// across backends so the services stay engine-agnostic.
#[async_trait]
pub trait CreditStore: Send + Sync {
    fn name(&self) -> &str;

    // Accounts.
    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>>;

    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Upsert the account at `new_balance` and append the paired
    /// transaction. The transaction amount is the delta against the
    /// previous balance, or `new_balance` for a freshly created account.
    async fn set_balance(
        &self,
        id: &str,
        new_balance: Decimal,
        entry: LedgerEntry,
    ) -> StoreResult<Transaction>;

    /// Partial-charge withdrawal: deduct `min(balance, amount)`, floor
    /// the balance at zero, append a transaction with the negated
    /// deducted amount. Missing accounts are created at zero balance.
    async fn withdraw(
        &self,
        id: &str,
        amount: Decimal,
        entry: LedgerEntry,
    ) -> StoreResult<WithdrawRecord>;

    // Groups and memberships.
    async fn upsert_group(&self, group: &Group) -> StoreResult<()>;

    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>>;

    async fn list_groups(&self) -> StoreResult<Vec<Group>>;

    /// Replace the account's full membership set (delete-all-then-insert).
    async fn replace_memberships(&self, account_id: &str, group_ids: &[String])
    -> StoreResult<()>;

    async fn memberships(&self, account_id: &str) -> StoreResult<Vec<String>>;

    // Models.
    async fn upsert_model(&self, model: &Model) -> StoreResult<()>;

    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>>;

    async fn list_models(&self) -> StoreResult<Vec<Model>>;

    // Transaction log (append happens through set_balance/withdraw).
    async fn list_transactions(
        &self,
        account_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<Transaction>>;

    // Usage statistics.
    /// Upsert the (account, year, month) row: add `credits`, bump the
    /// transaction count, union in `model_id`.
    async fn record_usage(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
        credits: Decimal,
        model_id: Option<&str>,
    ) -> StoreResult<()>;

    async fn account_statistics(
        &self,
        account_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<UsageStatistic>>;

    async fn statistics_for_month(&self, year: i32, month: u32)
    -> StoreResult<Vec<UsageStatistic>>;

    async fn statistics_for_year(&self, year: i32) -> StoreResult<Vec<UsageStatistic>>;

    /// Record the pre-reset balance on an existing month row. Returns
    /// false when the account has no row for that month.
    async fn set_balance_before_reset(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
        balance: Decimal,
    ) -> StoreResult<bool>;

    /// Create a zeroed statistics row if absent. Returns true when a
    /// row was created.
    async fn ensure_statistics_row(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
    ) -> StoreResult<bool>;

    // Reset events.
    /// Append a reset event. A `completed` event for a (reset_type,
    /// calendar month) that already holds a completed event is rejected
    /// with [`StoreError::DuplicateReset`]. Recording a completed event
    /// therefore doubles as claiming the month.
    async fn record_reset_event(&self, event: NewResetEvent) -> StoreResult<ResetEvent>;

    /// Fill in the final totals on a previously claimed event.
    async fn finalize_reset_event(
        &self,
        id: i64,
        users_affected: i64,
        total_credits_granted: Decimal,
    ) -> StoreResult<()>;

    /// Flip a claimed event to `failed`, releasing the month so a later
    /// attempt can claim it again.
    async fn fail_reset_event(&self, id: i64, error_message: &str) -> StoreResult<()>;

    async fn last_completed_reset(&self, reset_type: &str) -> StoreResult<Option<ResetEvent>>;

    async fn reset_history(&self, limit: u32) -> StoreResult<Vec<ResetEvent>>;

    // Settings.
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}
