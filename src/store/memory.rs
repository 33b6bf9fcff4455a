//! In-memory store for tests and single-process deployments.
//!
//! Composite operations take the write lock once, which gives them the
//! same atomicity the SQL backends get from transactions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::types::{
    Account, Group, Model, ResetEvent, ResetStatus, Transaction, UsageStatistic, month_start,
};

use super::{
    CreditStore, LedgerEntry, NewResetEvent, StoreError, StoreResult, WithdrawRecord,
};

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    groups: HashMap<String, Group>,
    memberships: HashMap<String, BTreeSet<String>>,
    models: HashMap<String, Model>,
    transactions: Vec<Transaction>,
    statistics: HashMap<(String, i32, u32), UsageStatistic>,
    reset_events: Vec<ResetEvent>,
    settings: HashMap<String, String>,
    next_transaction_id: i64,
    next_statistic_id: i64,
    next_event_id: i64,
}

impl Inner {
    fn append_transaction(
        &mut self,
        account_id: &str,
        amount: Decimal,
        balance_after: Decimal,
        entry: LedgerEntry,
    ) -> Transaction {
        self.next_transaction_id += 1;
        let transaction = Transaction {
            id: self.next_transaction_id,
            account_id: account_id.to_string(),
            amount,
            kind: entry.kind,
            reason: entry.reason,
            actor: entry.actor,
            balance_after,
            model_id: entry.model_id,
            prompt_tokens: entry.prompt_tokens,
            completion_tokens: entry.completion_tokens,
            created_at: entry.timestamp.unwrap_or_else(Utc::now),
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    fn upsert_account(&mut self, id: &str, balance: Decimal) -> Decimal {
        let now = Utc::now();
        match self.accounts.get_mut(id) {
            Some(account) => {
                let previous = account.balance;
                account.balance = balance;
                account.updated_at = now;
                previous
            }
            None => {
                self.accounts.insert(
                    id.to_string(),
                    Account {
                        id: id.to_string(),
                        balance,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Decimal::ZERO
            }
        }
    }
}

/// In-memory [`CreditStore`] backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts currently held.
    pub async fn account_count(&self) -> usize {
        self.inner.read().await.accounts.len()
    }

    /// Number of transactions appended so far.
    pub async fn transaction_count(&self) -> usize {
        self.inner.read().await.transactions.len()
    }
}

#[async_trait]
impl CreditStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        Ok(self.inner.read().await.accounts.get(id).cloned())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let inner = self.inner.read().await;
        let mut accounts: Vec<Account> = inner.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn set_balance(
        &self,
        id: &str,
        new_balance: Decimal,
        entry: LedgerEntry,
    ) -> StoreResult<Transaction> {
        let mut inner = self.inner.write().await;
        let existed = inner.accounts.contains_key(id);
        let previous = inner.upsert_account(id, new_balance);
        let amount = if existed { new_balance - previous } else { new_balance };
        Ok(inner.append_transaction(id, amount, new_balance, entry))
    }

    async fn withdraw(
        &self,
        id: &str,
        amount: Decimal,
        entry: LedgerEntry,
    ) -> StoreResult<WithdrawRecord> {
        let mut inner = self.inner.write().await;
        let current = inner
            .accounts
            .get(id)
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO);
        let deducted = current.min(amount);
        let new_balance = (current - amount).max(Decimal::ZERO);
        inner.upsert_account(id, new_balance);
        let transaction = inner.append_transaction(id, -deducted, new_balance, entry);
        Ok(WithdrawRecord {
            deducted,
            new_balance,
            transaction,
        })
    }

    async fn upsert_group(&self, group: &Group) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mut stored = group.clone();
        stored.updated_at = Utc::now();
        inner.groups.insert(group.id.clone(), stored);
        Ok(())
    }

    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        Ok(self.inner.read().await.groups.get(id).cloned())
    }

    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let inner = self.inner.read().await;
        let mut groups: Vec<Group> = inner.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn replace_memberships(
        &self,
        account_id: &str,
        group_ids: &[String],
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.memberships.insert(
            account_id.to_string(),
            group_ids.iter().cloned().collect(),
        );
        Ok(())
    }

    async fn memberships(&self, account_id: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memberships
            .get(account_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_model(&self, model: &Model) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mut stored = model.clone();
        stored.updated_at = Utc::now();
        inner.models.insert(model.id.clone(), stored);
        Ok(())
    }

    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
        Ok(self.inner.read().await.models.get(id).cloned())
    }

    async fn list_models(&self) -> StoreResult<Vec<Model>> {
        let inner = self.inner.read().await;
        let mut models: Vec<Model> = inner.models.values().cloned().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn list_transactions(
        &self,
        account_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|t| account_id.is_none_or(|id| t.account_id == id))
            .cloned()
            .collect();
        // Newest first; ids are monotonic within the store.
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn record_usage(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
        credits: Decimal,
        model_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let key = (account_id.to_string(), year, month);
        let now = Utc::now();
        match inner.statistics.get_mut(&key) {
            Some(row) => {
                row.credits_used += credits;
                row.transactions_count += 1;
                if let Some(model_id) = model_id {
                    row.models_used.insert(model_id.to_string());
                }
                row.updated_at = now;
            }
            None => {
                inner.next_statistic_id += 1;
                let mut row = UsageStatistic::empty(account_id, year, month);
                row.id = inner.next_statistic_id;
                row.credits_used = credits;
                row.transactions_count = 1;
                if let Some(model_id) = model_id {
                    row.models_used.insert(model_id.to_string());
                }
                inner.statistics.insert(key, row);
            }
        }
        Ok(())
    }

    async fn account_statistics(
        &self,
        account_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<UsageStatistic>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<UsageStatistic> = inner
            .statistics
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn statistics_for_month(
        &self,
        year: i32,
        month: u32,
    ) -> StoreResult<Vec<UsageStatistic>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<UsageStatistic> = inner
            .statistics
            .values()
            .filter(|s| s.year == year && s.month == month)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.credits_used.cmp(&a.credits_used));
        Ok(rows)
    }

    async fn statistics_for_year(&self, year: i32) -> StoreResult<Vec<UsageStatistic>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<UsageStatistic> = inner
            .statistics
            .values()
            .filter(|s| s.year == year)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.month, &a.account_id).cmp(&(b.month, &b.account_id)));
        Ok(rows)
    }

    async fn set_balance_before_reset(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
        balance: Decimal,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (account_id.to_string(), year, month);
        match inner.statistics.get_mut(&key) {
            Some(row) => {
                row.balance_before_reset = Some(balance);
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ensure_statistics_row(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (account_id.to_string(), year, month);
        if inner.statistics.contains_key(&key) {
            return Ok(false);
        }
        inner.next_statistic_id += 1;
        let mut row = UsageStatistic::empty(account_id, year, month);
        row.id = inner.next_statistic_id;
        inner.statistics.insert(key, row);
        Ok(true)
    }

    async fn record_reset_event(&self, event: NewResetEvent) -> StoreResult<ResetEvent> {
        let mut inner = self.inner.write().await;
        if event.status == ResetStatus::Completed {
            let month = month_start(event.reset_date);
            let conflict = inner.reset_events.iter().any(|existing| {
                existing.status == ResetStatus::Completed
                    && existing.reset_type == event.reset_type
                    && month_start(existing.reset_date) == month
            });
            if conflict {
                return Err(StoreError::DuplicateReset {
                    reset_type: event.reset_type,
                    month,
                });
            }
        }
        inner.next_event_id += 1;
        let stored = ResetEvent {
            id: inner.next_event_id,
            reset_type: event.reset_type,
            reset_date: event.reset_date,
            users_affected: event.users_affected,
            total_credits_granted: event.total_credits_granted,
            status: event.status,
            error_message: event.error_message,
            metadata: event.metadata,
            created_at: Utc::now(),
        };
        inner.reset_events.push(stored.clone());
        Ok(stored)
    }

    async fn finalize_reset_event(
        &self,
        id: i64,
        users_affected: i64,
        total_credits_granted: Decimal,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.reset_events.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                event.users_affected = users_affected;
                event.total_credits_granted = total_credits_granted;
                Ok(())
            }
            None => Err(StoreError::Backend {
                message: format!("reset event not found: {id}"),
            }),
        }
    }

    async fn fail_reset_event(&self, id: i64, error_message: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.reset_events.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                event.status = ResetStatus::Failed;
                event.error_message = Some(error_message.to_string());
                Ok(())
            }
            None => Err(StoreError::Backend {
                message: format!("reset event not found: {id}"),
            }),
        }
    }

    async fn last_completed_reset(&self, reset_type: &str) -> StoreResult<Option<ResetEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .reset_events
            .iter()
            .filter(|e| e.status == ResetStatus::Completed && e.reset_type == reset_type)
            .max_by_key(|e| (e.reset_date, e.id))
            .cloned())
    }

    async fn reset_history(&self, limit: u32) -> StoreResult<Vec<ResetEvent>> {
        let inner = self.inner.read().await;
        let mut events = inner.reset_events.clone();
        events.sort_by(|a, b| b.id.cmp(&a.id));
        events.truncate(limit as usize);
        Ok(events)
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn entry(kind: TransactionKind) -> LedgerEntry {
        LedgerEntry::new(kind, "test", "test entry")
    }

    #[tokio::test]
    async fn withdraw_covers_full_amount() {
        let store = MemoryStore::new();
        store
            .set_balance("alice", dec!(100), entry(TransactionKind::ManualUpdate))
            .await
            .unwrap();

        let record = store
            .withdraw("alice", dec!(30), entry(TransactionKind::Deduct))
            .await
            .unwrap();

        assert_eq!(record.deducted, dec!(30));
        assert_eq!(record.new_balance, dec!(70));
        assert_eq!(record.transaction.amount, dec!(-30));
        assert_eq!(record.transaction.balance_after, dec!(70));
    }

    #[tokio::test]
    async fn withdraw_partial_charge_floors_at_zero() {
        let store = MemoryStore::new();
        store
            .set_balance("bob", dec!(10), entry(TransactionKind::ManualUpdate))
            .await
            .unwrap();

        let record = store
            .withdraw("bob", dec!(25), entry(TransactionKind::Deduct))
            .await
            .unwrap();

        assert_eq!(record.deducted, dec!(10));
        assert_eq!(record.new_balance, dec!(0));
        assert_eq!(record.transaction.amount, dec!(-10));
    }

    #[tokio::test]
    async fn withdraw_creates_missing_account_at_zero() {
        let store = MemoryStore::new();
        let record = store
            .withdraw("ghost", dec!(5), entry(TransactionKind::Deduct))
            .await
            .unwrap();

        assert_eq!(record.deducted, dec!(0));
        assert_eq!(record.new_balance, dec!(0));
        let account = store.get_account("ghost").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(0));
    }

    #[tokio::test]
    async fn set_balance_amount_is_delta_for_existing_account() {
        let store = MemoryStore::new();
        let first = store
            .set_balance("carol", dec!(50), entry(TransactionKind::Sync))
            .await
            .unwrap();
        assert_eq!(first.amount, dec!(50));

        let second = store
            .set_balance("carol", dec!(80), entry(TransactionKind::ManualUpdate))
            .await
            .unwrap();
        assert_eq!(second.amount, dec!(30));
        assert_eq!(second.balance_after, dec!(80));
    }

    #[tokio::test]
    async fn replace_memberships_is_destructive() {
        let store = MemoryStore::new();
        store
            .replace_memberships("alice", &["g1".into(), "g2".into()])
            .await
            .unwrap();
        store.replace_memberships("alice", &["g3".into()]).await.unwrap();

        assert_eq!(store.memberships("alice").await.unwrap(), vec!["g3".to_string()]);
    }

    #[tokio::test]
    async fn record_usage_accumulates_and_unions_models() {
        let store = MemoryStore::new();
        store
            .record_usage("alice", 2025, 8, dec!(1.5), Some("gpt-4"))
            .await
            .unwrap();
        store
            .record_usage("alice", 2025, 8, dec!(0.5), Some("gpt-4"))
            .await
            .unwrap();
        store
            .record_usage("alice", 2025, 8, dec!(1.0), Some("mistral"))
            .await
            .unwrap();

        let rows = store.account_statistics("alice", 12).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credits_used, dec!(3.0));
        assert_eq!(rows[0].transactions_count, 3);
        assert_eq!(rows[0].models_used.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_completed_reset_is_rejected() {
        let store = MemoryStore::new();
        let date_a = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let date_b = NaiveDate::from_ymd_opt(2025, 8, 20).unwrap();

        let event = NewResetEvent {
            reset_type: "monthly".into(),
            reset_date: date_a,
            users_affected: 3,
            total_credits_granted: dec!(900),
            status: ResetStatus::Completed,
            error_message: None,
            metadata: None,
        };
        store.record_reset_event(event.clone()).await.unwrap();

        let conflict = store
            .record_reset_event(NewResetEvent {
                reset_date: date_b,
                ..event.clone()
            })
            .await;
        assert!(matches!(conflict, Err(StoreError::DuplicateReset { .. })));

        // Failed events for the same month are still recordable.
        store
            .record_reset_event(NewResetEvent {
                status: ResetStatus::Failed,
                error_message: Some("boom".into()),
                ..event
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transactions_paginate_newest_first() {
        let store = MemoryStore::new();
        for i in 1..=5 {
            store
                .set_balance("alice", Decimal::from(i), entry(TransactionKind::ManualUpdate))
                .await
                .unwrap();
        }

        let page = store.list_transactions(Some("alice"), 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].balance_after, dec!(4));
        assert_eq!(page[1].balance_after, dec!(3));
    }
}
