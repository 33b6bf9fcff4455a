//! Domain records shared by the store backends and the services.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A billable principal with a credit balance.
///
/// Owned by the ledger store; the balance only moves through
/// `set_balance`, `withdraw`, or the monthly reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A credit group with a default monthly allowance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub default_credits: Decimal,
    /// Marks the implicit group every account belongs to, with or
    /// without an explicit membership row.
    pub is_baseline: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>, default_credits: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            default_credits,
            is_baseline: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn baseline(
        id: impl Into<String>,
        name: impl Into<String>,
        default_credits: Decimal,
    ) -> Self {
        Self {
            is_baseline: true,
            ..Self::new(id, name, default_credits)
        }
    }
}

/// Per-model token pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    /// Credits per input (prompt) token.
    pub context_price: Decimal,
    /// Credits per output (completion) token.
    pub generation_price: Decimal,
    pub is_free: bool,
    pub is_available: bool,
    pub is_restricted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        context_price: Decimal,
        generation_price: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            context_price,
            generation_price,
            is_free: false,
            is_available: true,
            is_restricted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn free(mut self) -> Self {
        self.is_free = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.is_available = false;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.is_restricted = true;
        self
    }
}

/// Classification of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Usage-driven withdrawal.
    Deduct,
    /// Manual admin adjustment.
    ManualUpdate,
    /// Allowance grant performed by the monthly reset.
    MonthlyReset,
    /// Balance written by the membership import.
    Sync,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deduct => "deduct",
            Self::ManualUpdate => "manual_update",
            Self::MonthlyReset => "monthly_reset",
            Self::Sync => "sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deduct" => Some(Self::Deduct),
            "manual_update" => Some(Self::ManualUpdate),
            "monthly_reset" => Some(Self::MonthlyReset),
            "sync" => Some(Self::Sync),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable row of the transaction log.
///
/// `balance_after` always equals the account balance immediately after
/// this transaction was applied; the pairing is committed atomically
/// with the balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub account_id: String,
    /// Signed amount; negative for deductions.
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub reason: String,
    pub actor: String,
    pub balance_after: Decimal,
    pub model_id: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Per-account, per-calendar-month usage totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStatistic {
    pub id: i64,
    pub account_id: String,
    pub year: i32,
    /// 1-12.
    pub month: u32,
    pub credits_used: Decimal,
    pub transactions_count: i64,
    pub models_used: BTreeSet<String>,
    /// Filled in by the *next* month's reset with the balance the
    /// account ended this month with.
    pub balance_before_reset: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsageStatistic {
    /// Synthesized zero row for months without recorded usage.
    pub fn empty(account_id: impl Into<String>, year: i32, month: u32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            account_id: account_id.into(),
            year,
            month,
            credits_used: Decimal::ZERO,
            transactions_count: 0,
            models_used: BTreeSet::new(),
            balance_before_reset: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome status of a reset execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStatus {
    Completed,
    Failed,
}

impl ResetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ResetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one reset execution attempt.
///
/// Append-only; the most recent `completed` event is also the source of
/// truth for the once-per-month idempotency guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetEvent {
    pub id: i64,
    pub reset_type: String,
    pub reset_date: NaiveDate,
    pub users_affected: i64,
    pub total_credits_granted: Decimal,
    pub status: ResetStatus,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Cross-account totals for one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub year: i32,
    pub month: u32,
    pub total_credits_used: Decimal,
    pub total_transactions: i64,
    pub unique_accounts: usize,
    pub unique_models: usize,
}

/// Cross-account totals for one year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlySummary {
    pub year: i32,
    pub total_credits_used: Decimal,
    pub total_transactions: i64,
    pub unique_accounts: usize,
    pub unique_models: usize,
}

/// Balance view exposed to collaborators: current balance plus the
/// allowance the next reset would grant and the groups producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOverview {
    pub account_id: String,
    pub balance: Decimal,
    pub allowance: Decimal,
    pub group_names: Vec<String>,
}

/// Result of charging an inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub account_id: String,
    pub model_id: String,
    pub cost: Decimal,
    pub prompt_cost: Decimal,
    pub completion_cost: Decimal,
    /// Actually charged; less than `cost` when the balance could not
    /// cover it (partial charge).
    pub deducted: Decimal,
    pub new_balance: Decimal,
}

/// First day of the month `date` falls in.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Calendar month preceding (year, month).
pub fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month <= 1 { (year - 1, 12) } else { (year, month - 1) }
}

/// (year, month) of the given instant.
pub fn year_month(now: DateTime<Utc>) -> (i32, u32) {
    (now.year(), now.month())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_kind_round_trips() {
        for kind in [
            TransactionKind::Deduct,
            TransactionKind::ManualUpdate,
            TransactionKind::MonthlyReset,
            TransactionKind::Sync,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("refund"), None);
    }

    #[test]
    fn reset_status_round_trips() {
        assert_eq!(ResetStatus::parse("completed"), Some(ResetStatus::Completed));
        assert_eq!(ResetStatus::parse("failed"), Some(ResetStatus::Failed));
        assert_eq!(ResetStatus::parse("pending"), None);
    }

    #[test]
    fn month_helpers() {
        let d = NaiveDate::from_ymd_opt(2025, 8, 23).unwrap();
        assert_eq!(month_start(d), NaiveDate::from_ymd_opt(2025, 8, 1).unwrap());
        assert_eq!(previous_month(2025, 8), (2025, 7));
        assert_eq!(previous_month(2025, 1), (2024, 12));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionKind::MonthlyReset).unwrap();
        assert_eq!(json, "\"monthly_reset\"");
    }
}
