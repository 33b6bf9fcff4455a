//! SQLite store backend.
//!
//! Enable with the `sqlite` feature flag. Suited to single-node
//! deployments and local development. Decimal columns are persisted as
//! TEXT because the sqlite driver has no native NUMERIC mapping; values
//! round-trip through `Decimal`'s string form losslessly.

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::types::{
    Account, Group, Model, ResetEvent, ResetStatus, Transaction, TransactionKind, UsageStatistic,
    month_start,
};

use super::{
    CreditStore, LedgerEntry, NewResetEvent, StoreError, StoreResult, WithdrawRecord,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS credit_accounts (
        id TEXT PRIMARY KEY,
        balance TEXT NOT NULL DEFAULT '0',
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_groups (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        default_credits TEXT NOT NULL DEFAULT '0',
        is_baseline INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_memberships (
        account_id TEXT NOT NULL,
        group_id TEXT NOT NULL,
        PRIMARY KEY (account_id, group_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_models (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        context_price TEXT NOT NULL DEFAULT '0',
        generation_price TEXT NOT NULL DEFAULT '0',
        is_free INTEGER NOT NULL DEFAULT 0,
        is_available INTEGER NOT NULL DEFAULT 1,
        is_restricted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id TEXT NOT NULL,
        amount TEXT NOT NULL,
        kind TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        actor TEXT NOT NULL DEFAULT '',
        balance_after TEXT NOT NULL,
        model_id TEXT,
        prompt_tokens INTEGER,
        completion_tokens INTEGER,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_usage_statistics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id TEXT NOT NULL,
        year INTEGER NOT NULL,
        month INTEGER NOT NULL,
        credits_used TEXT NOT NULL DEFAULT '0',
        transactions_count INTEGER NOT NULL DEFAULT 0,
        models_used TEXT NOT NULL DEFAULT '[]',
        balance_before_reset TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (account_id, year, month)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_reset_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        reset_type TEXT NOT NULL,
        reset_date TEXT NOT NULL,
        month_start TEXT NOT NULL,
        users_affected INTEGER NOT NULL DEFAULT 0,
        total_credits_granted TEXT NOT NULL DEFAULT '0',
        status TEXT NOT NULL,
        error_message TEXT,
        metadata TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_credit_transactions_account ON credit_transactions (account_id)",
    "CREATE INDEX IF NOT EXISTS idx_credit_usage_stats_month ON credit_usage_statistics (year, month)",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_reset_completed_month
        ON credit_reset_events (reset_type, month_start)
        WHERE status = 'completed'
    "#,
];

/// SQLite [`CreditStore`] backend.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if absent) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Fresh in-memory database, mainly for tests. Pinned to one
    /// connection because each `:memory:` connection is its own
    /// database.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
    }
}

fn decimal_column(row: &SqliteRow, column: &str) -> StoreResult<Decimal> {
    let raw: String = row.try_get(column).map_err(db_err)?;
    Decimal::from_str(&raw).map_err(|err| StoreError::Backend {
        message: format!("bad decimal in column {column}: {err}"),
    })
}

fn optional_decimal_column(row: &SqliteRow, column: &str) -> StoreResult<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column).map_err(db_err)?;
    raw.map(|raw| {
        Decimal::from_str(&raw).map_err(|err| StoreError::Backend {
            message: format!("bad decimal in column {column}: {err}"),
        })
    })
    .transpose()
}

fn account_from_row(row: &SqliteRow) -> StoreResult<Account> {
    Ok(Account {
        id: row.try_get("id").map_err(db_err)?,
        balance: decimal_column(row, "balance")?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn group_from_row(row: &SqliteRow) -> StoreResult<Group> {
    Ok(Group {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        default_credits: decimal_column(row, "default_credits")?,
        is_baseline: row.try_get("is_baseline").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn model_from_row(row: &SqliteRow) -> StoreResult<Model> {
    Ok(Model {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        context_price: decimal_column(row, "context_price")?,
        generation_price: decimal_column(row, "generation_price")?,
        is_free: row.try_get("is_free").map_err(db_err)?,
        is_available: row.try_get("is_available").map_err(db_err)?,
        is_restricted: row.try_get("is_restricted").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> StoreResult<Transaction> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let kind = TransactionKind::parse(&kind).ok_or_else(|| StoreError::Backend {
        message: format!("unknown transaction kind in storage: {kind}"),
    })?;
    Ok(Transaction {
        id: row.try_get("id").map_err(db_err)?,
        account_id: row.try_get("account_id").map_err(db_err)?,
        amount: decimal_column(row, "amount")?,
        kind,
        reason: row.try_get("reason").map_err(db_err)?,
        actor: row.try_get("actor").map_err(db_err)?,
        balance_after: decimal_column(row, "balance_after")?,
        model_id: row.try_get("model_id").map_err(db_err)?,
        prompt_tokens: row.try_get("prompt_tokens").map_err(db_err)?,
        completion_tokens: row.try_get("completion_tokens").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn statistic_from_row(row: &SqliteRow) -> StoreResult<UsageStatistic> {
    let models_used: String = row.try_get("models_used").map_err(db_err)?;
    let month: i64 = row.try_get("month").map_err(db_err)?;
    Ok(UsageStatistic {
        id: row.try_get("id").map_err(db_err)?,
        account_id: row.try_get("account_id").map_err(db_err)?,
        year: row.try_get("year").map_err(db_err)?,
        month: month as u32,
        credits_used: decimal_column(row, "credits_used")?,
        transactions_count: row.try_get("transactions_count").map_err(db_err)?,
        models_used: serde_json::from_str::<BTreeSet<String>>(&models_used)?,
        balance_before_reset: optional_decimal_column(row, "balance_before_reset")?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<ResetEvent> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let status = ResetStatus::parse(&status).ok_or_else(|| StoreError::Backend {
        message: format!("unknown reset status in storage: {status}"),
    })?;
    let metadata: Option<String> = row.try_get("metadata").map_err(db_err)?;
    let metadata = metadata
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    Ok(ResetEvent {
        id: row.try_get("id").map_err(db_err)?,
        reset_type: row.try_get("reset_type").map_err(db_err)?,
        reset_date: row.try_get("reset_date").map_err(db_err)?,
        users_affected: row.try_get("users_affected").map_err(db_err)?,
        total_credits_granted: decimal_column(row, "total_credits_granted")?,
        status,
        error_message: row.try_get("error_message").map_err(db_err)?,
        metadata,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

#[async_trait]
impl CreditStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM credit_accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM credit_accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn set_balance(
        &self,
        id: &str,
        new_balance: Decimal,
        entry: LedgerEntry,
    ) -> StoreResult<Transaction> {
        // The sqlite pool serializes writers, so the read-modify-write
        // below is not racy within one process.
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let previous: Option<Decimal> =
            sqlx::query("SELECT balance FROM credit_accounts WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .as_ref()
                .map(|row| decimal_column(row, "balance"))
                .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO credit_accounts (id, balance) VALUES (?, ?)
            ON CONFLICT (id) DO UPDATE SET balance = excluded.balance,
                updated_at = datetime('now')
            "#,
        )
        .bind(id)
        .bind(new_balance.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let amount = match previous {
            Some(previous) => new_balance - previous,
            None => new_balance,
        };

        let row = sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (account_id, amount, kind, reason, actor, balance_after,
                 model_id, prompt_tokens, completion_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, COALESCE(?, datetime('now')))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(amount.to_string())
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(&entry.actor)
        .bind(new_balance.to_string())
        .bind(&entry.model_id)
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(entry.timestamp)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let transaction = transaction_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(transaction)
    }

    async fn withdraw(
        &self,
        id: &str,
        amount: Decimal,
        entry: LedgerEntry,
    ) -> StoreResult<WithdrawRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO credit_accounts (id, balance) VALUES (?, '0') ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT balance FROM credit_accounts WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let current = decimal_column(&row, "balance")?;

        let deducted = current.min(amount);
        let new_balance = (current - amount).max(Decimal::ZERO);

        sqlx::query(
            "UPDATE credit_accounts SET balance = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(new_balance.to_string())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (account_id, amount, kind, reason, actor, balance_after,
                 model_id, prompt_tokens, completion_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, COALESCE(?, datetime('now')))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind((-deducted).to_string())
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(&entry.actor)
        .bind(new_balance.to_string())
        .bind(&entry.model_id)
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(entry.timestamp)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let transaction = transaction_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;

        Ok(WithdrawRecord {
            deducted,
            new_balance,
            transaction,
        })
    }

    async fn upsert_group(&self, group: &Group) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_groups (id, name, default_credits, is_baseline)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                default_credits = excluded.default_credits,
                is_baseline = excluded.is_baseline,
                updated_at = datetime('now')
            "#,
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(group.default_credits.to_string())
        .bind(group.is_baseline)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        let row = sqlx::query("SELECT * FROM credit_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM credit_groups ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(group_from_row).collect()
    }

    async fn replace_memberships(
        &self,
        account_id: &str,
        group_ids: &[String],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM credit_memberships WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for group_id in group_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO credit_memberships (account_id, group_id) VALUES (?, ?)",
            )
            .bind(account_id)
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn memberships(&self, account_id: &str) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT group_id FROM credit_memberships WHERE account_id = ? ORDER BY group_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| row.try_get("group_id").map_err(db_err))
            .collect()
    }

    async fn upsert_model(&self, model: &Model) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_models
                (id, name, context_price, generation_price, is_free, is_available, is_restricted)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                context_price = excluded.context_price,
                generation_price = excluded.generation_price,
                is_free = excluded.is_free,
                is_available = excluded.is_available,
                is_restricted = excluded.is_restricted,
                updated_at = datetime('now')
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(model.context_price.to_string())
        .bind(model.generation_price.to_string())
        .bind(model.is_free)
        .bind(model.is_available)
        .bind(model.is_restricted)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
        let row = sqlx::query("SELECT * FROM credit_models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn list_models(&self) -> StoreResult<Vec<Model>> {
        let rows = sqlx::query("SELECT * FROM credit_models ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(model_from_row).collect()
    }

    async fn list_transactions(
        &self,
        account_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<Transaction>> {
        let rows = match account_id {
            Some(account_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM credit_transactions WHERE account_id = ?
                    ORDER BY id DESC LIMIT ? OFFSET ?
                    "#,
                )
                .bind(account_id)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM credit_transactions ORDER BY id DESC LIMIT ? OFFSET ?")
                    .bind(i64::from(limit))
                    .bind(i64::from(offset))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn record_usage(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
        credits: Decimal,
        model_id: Option<&str>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT credits_used, models_used FROM credit_usage_statistics
            WHERE account_id = ? AND year = ? AND month = ?
            "#,
        )
        .bind(account_id)
        .bind(year)
        .bind(month as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let current = decimal_column(&row, "credits_used")?;
                let raw: String = row.try_get("models_used").map_err(db_err)?;
                let mut models: BTreeSet<String> = serde_json::from_str(&raw)?;
                if let Some(model_id) = model_id {
                    models.insert(model_id.to_string());
                }
                sqlx::query(
                    r#"
                    UPDATE credit_usage_statistics
                    SET credits_used = ?, transactions_count = transactions_count + 1,
                        models_used = ?, updated_at = datetime('now')
                    WHERE account_id = ? AND year = ? AND month = ?
                    "#,
                )
                .bind((current + credits).to_string())
                .bind(serde_json::to_string(&models)?)
                .bind(account_id)
                .bind(year)
                .bind(month as i64)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            None => {
                let mut models = BTreeSet::new();
                if let Some(model_id) = model_id {
                    models.insert(model_id.to_string());
                }
                sqlx::query(
                    r#"
                    INSERT INTO credit_usage_statistics
                        (account_id, year, month, credits_used, transactions_count, models_used)
                    VALUES (?, ?, ?, ?, 1, ?)
                    "#,
                )
                .bind(account_id)
                .bind(year)
                .bind(month as i64)
                .bind(credits.to_string())
                .bind(serde_json::to_string(&models)?)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)
    }

    async fn account_statistics(
        &self,
        account_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<UsageStatistic>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM credit_usage_statistics WHERE account_id = ?
            ORDER BY year DESC, month DESC LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(statistic_from_row).collect()
    }

    async fn statistics_for_month(
        &self,
        year: i32,
        month: u32,
    ) -> StoreResult<Vec<UsageStatistic>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM credit_usage_statistics WHERE year = ? AND month = ?
            ORDER BY CAST(credits_used AS REAL) DESC
            "#,
        )
        .bind(year)
        .bind(month as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(statistic_from_row).collect()
    }

    async fn statistics_for_year(&self, year: i32) -> StoreResult<Vec<UsageStatistic>> {
        let rows = sqlx::query(
            "SELECT * FROM credit_usage_statistics WHERE year = ? ORDER BY month, account_id",
        )
        .bind(year)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(statistic_from_row).collect()
    }

    async fn set_balance_before_reset(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
        balance: Decimal,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credit_usage_statistics
            SET balance_before_reset = ?, updated_at = datetime('now')
            WHERE account_id = ? AND year = ? AND month = ?
            "#,
        )
        .bind(balance.to_string())
        .bind(account_id)
        .bind(year)
        .bind(month as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ensure_statistics_row(
        &self,
        account_id: &str,
        year: i32,
        month: u32,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO credit_usage_statistics (account_id, year, month)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(year)
        .bind(month as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_reset_event(&self, event: NewResetEvent) -> StoreResult<ResetEvent> {
        let month = month_start(event.reset_date);
        let metadata = event
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO credit_reset_events
                (reset_type, reset_date, month_start, users_affected,
                 total_credits_granted, status, error_message, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&event.reset_type)
        .bind(event.reset_date)
        .bind(month)
        .bind(event.users_affected)
        .bind(event.total_credits_granted.to_string())
        .bind(event.status.as_str())
        .bind(&event.error_message)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => event_from_row(&row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateReset {
                    reset_type: event.reset_type,
                    month,
                })
            }
            Err(err) => Err(db_err(err)),
        }
    }

    async fn finalize_reset_event(
        &self,
        id: i64,
        users_affected: i64,
        total_credits_granted: Decimal,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE credit_reset_events
            SET users_affected = ?, total_credits_granted = ?
            WHERE id = ?
            "#,
        )
        .bind(users_affected)
        .bind(total_credits_granted.to_string())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend {
                message: format!("reset event not found: {id}"),
            });
        }
        Ok(())
    }

    async fn fail_reset_event(&self, id: i64, error_message: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE credit_reset_events SET status = 'failed', error_message = ? WHERE id = ?",
        )
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend {
                message: format!("reset event not found: {id}"),
            });
        }
        Ok(())
    }

    async fn last_completed_reset(&self, reset_type: &str) -> StoreResult<Option<ResetEvent>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM credit_reset_events
            WHERE reset_type = ? AND status = 'completed'
            ORDER BY reset_date DESC, id DESC LIMIT 1
            "#,
        )
        .bind(reset_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn reset_history(&self, limit: u32) -> StoreResult<Vec<ResetEvent>> {
        let rows = sqlx::query("SELECT * FROM credit_reset_events ORDER BY id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM credit_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| row.try_get("value").map_err(db_err))
            .transpose()
    }

    async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_settings (key, value) VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value,
                updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;
    use rust_decimal_macros::dec;

    async fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn balance_round_trips_through_text() {
        let store = store().await;
        store
            .set_balance(
                "alice",
                dec!(123.456789),
                LedgerEntry::new(TransactionKind::ManualUpdate, "admin", "seed"),
            )
            .await
            .unwrap();

        let account = store.get_account("alice").await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(123.456789));

        let record = store
            .withdraw(
                "alice",
                dec!(23.456789),
                LedgerEntry::new(TransactionKind::Deduct, "system", "usage"),
            )
            .await
            .unwrap();
        assert_eq!(record.new_balance, dec!(100));
        assert_eq!(record.transaction.amount, dec!(-23.456789));
    }

    #[tokio::test]
    async fn month_statistics_sort_numerically_descending() {
        let store = store().await;
        // Lexicographic TEXT ordering would put "9" after "10".
        store
            .record_usage("alice", 2025, 8, dec!(9), Some("m"))
            .await
            .unwrap();
        store
            .record_usage("bob", 2025, 8, dec!(10), Some("m"))
            .await
            .unwrap();
        store
            .record_usage("carol", 2025, 8, dec!(2), None)
            .await
            .unwrap();

        let rows = store.statistics_for_month(2025, 8).await.unwrap();
        let order: Vec<&str> = rows.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(order, ["bob", "alice", "carol"]);
    }

    #[tokio::test]
    async fn duplicate_completed_reset_maps_to_conflict() {
        let store = store().await;
        let event = NewResetEvent {
            reset_type: "monthly".into(),
            reset_date: chrono::NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
            users_affected: 1,
            total_credits_granted: dec!(100),
            status: ResetStatus::Completed,
            error_message: None,
            metadata: None,
        };
        store.record_reset_event(event.clone()).await.unwrap();

        let conflict = store
            .record_reset_event(NewResetEvent {
                reset_date: chrono::NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(),
                ..event
            })
            .await;
        assert!(matches!(conflict, Err(StoreError::DuplicateReset { .. })));
    }
}
