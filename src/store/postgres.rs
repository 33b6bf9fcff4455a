//! PostgreSQL store backend.
//!
//! Enable with the `postgres` feature flag. Balance mutations run in a
//! single transaction with a `SELECT ... FOR UPDATE` row lock so two
//! concurrent withdrawals on the same account cannot both read the same
//! starting balance. Reset idempotency across service instances is
//! enforced by a partial unique index on (reset_type, month_start) for
//! completed events.

use std::collections::BTreeSet;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

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
        id VARCHAR(255) PRIMARY KEY,
        balance NUMERIC(20, 6) NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_groups (
        id VARCHAR(255) PRIMARY KEY,
        name TEXT NOT NULL,
        default_credits NUMERIC(20, 6) NOT NULL DEFAULT 0,
        is_baseline BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_memberships (
        account_id VARCHAR(255) NOT NULL,
        group_id VARCHAR(255) NOT NULL,
        PRIMARY KEY (account_id, group_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_models (
        id VARCHAR(255) PRIMARY KEY,
        name TEXT NOT NULL,
        context_price NUMERIC(20, 10) NOT NULL DEFAULT 0,
        generation_price NUMERIC(20, 10) NOT NULL DEFAULT 0,
        is_free BOOLEAN NOT NULL DEFAULT FALSE,
        is_available BOOLEAN NOT NULL DEFAULT TRUE,
        is_restricted BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_transactions (
        id BIGSERIAL PRIMARY KEY,
        account_id VARCHAR(255) NOT NULL,
        amount NUMERIC(20, 6) NOT NULL,
        kind VARCHAR(32) NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        actor TEXT NOT NULL DEFAULT '',
        balance_after NUMERIC(20, 6) NOT NULL,
        model_id VARCHAR(255),
        prompt_tokens BIGINT,
        completion_tokens BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_usage_statistics (
        id BIGSERIAL PRIMARY KEY,
        account_id VARCHAR(255) NOT NULL,
        year INT NOT NULL,
        month INT NOT NULL,
        credits_used NUMERIC(20, 6) NOT NULL DEFAULT 0,
        transactions_count BIGINT NOT NULL DEFAULT 0,
        models_used TEXT NOT NULL DEFAULT '[]',
        balance_before_reset NUMERIC(20, 6),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (account_id, year, month)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_reset_events (
        id BIGSERIAL PRIMARY KEY,
        reset_type VARCHAR(32) NOT NULL,
        reset_date DATE NOT NULL,
        month_start DATE NOT NULL,
        users_affected BIGINT NOT NULL DEFAULT 0,
        total_credits_granted NUMERIC(20, 6) NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL,
        error_message TEXT,
        metadata TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credit_settings (
        key VARCHAR(255) PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_credit_transactions_account ON credit_transactions (account_id)",
    "CREATE INDEX IF NOT EXISTS idx_credit_transactions_created ON credit_transactions (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_credit_usage_stats_month ON credit_usage_statistics (year, month)",
    "CREATE INDEX IF NOT EXISTS idx_credit_memberships_account ON credit_memberships (account_id)",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_reset_completed_month
        ON credit_reset_events (reset_type, month_start)
        WHERE status = 'completed'
    "#,
];

/// PostgreSQL [`CreditStore`] backend.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Use an existing connection pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
    }
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    Ok(Account {
        id: row.try_get("id").map_err(db_err)?,
        balance: row.try_get("balance").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn group_from_row(row: &PgRow) -> StoreResult<Group> {
    Ok(Group {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        default_credits: row.try_get("default_credits").map_err(db_err)?,
        is_baseline: row.try_get("is_baseline").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn model_from_row(row: &PgRow) -> StoreResult<Model> {
    Ok(Model {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        context_price: row.try_get("context_price").map_err(db_err)?,
        generation_price: row.try_get("generation_price").map_err(db_err)?,
        is_free: row.try_get("is_free").map_err(db_err)?,
        is_available: row.try_get("is_available").map_err(db_err)?,
        is_restricted: row.try_get("is_restricted").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn parse_kind(value: &str) -> StoreResult<TransactionKind> {
    TransactionKind::parse(value).ok_or_else(|| StoreError::Backend {
        message: format!("unknown transaction kind in storage: {value}"),
    })
}

fn parse_status(value: &str) -> StoreResult<ResetStatus> {
    ResetStatus::parse(value).ok_or_else(|| StoreError::Backend {
        message: format!("unknown reset status in storage: {value}"),
    })
}

fn transaction_from_row(row: &PgRow) -> StoreResult<Transaction> {
    let kind: String = row.try_get("kind").map_err(db_err)?;
    Ok(Transaction {
        id: row.try_get("id").map_err(db_err)?,
        account_id: row.try_get("account_id").map_err(db_err)?,
        amount: row.try_get("amount").map_err(db_err)?,
        kind: parse_kind(&kind)?,
        reason: row.try_get("reason").map_err(db_err)?,
        actor: row.try_get("actor").map_err(db_err)?,
        balance_after: row.try_get("balance_after").map_err(db_err)?,
        model_id: row.try_get("model_id").map_err(db_err)?,
        prompt_tokens: row.try_get("prompt_tokens").map_err(db_err)?,
        completion_tokens: row.try_get("completion_tokens").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn statistic_from_row(row: &PgRow) -> StoreResult<UsageStatistic> {
    let models_used: String = row.try_get("models_used").map_err(db_err)?;
    let month: i32 = row.try_get("month").map_err(db_err)?;
    Ok(UsageStatistic {
        id: row.try_get("id").map_err(db_err)?,
        account_id: row.try_get("account_id").map_err(db_err)?,
        year: row.try_get("year").map_err(db_err)?,
        month: month as u32,
        credits_used: row.try_get("credits_used").map_err(db_err)?,
        transactions_count: row.try_get("transactions_count").map_err(db_err)?,
        models_used: serde_json::from_str::<BTreeSet<String>>(&models_used)?,
        balance_before_reset: row.try_get("balance_before_reset").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<ResetEvent> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let metadata: Option<String> = row.try_get("metadata").map_err(db_err)?;
    let metadata = metadata
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    Ok(ResetEvent {
        id: row.try_get("id").map_err(db_err)?,
        reset_type: row.try_get("reset_type").map_err(db_err)?,
        reset_date: row.try_get("reset_date").map_err(db_err)?,
        users_affected: row.try_get("users_affected").map_err(db_err)?,
        total_credits_granted: row.try_get("total_credits_granted").map_err(db_err)?,
        status: parse_status(&status)?,
        error_message: row.try_get("error_message").map_err(db_err)?,
        metadata,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

#[async_trait]
impl CreditStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn get_account(&self, id: &str) -> StoreResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM credit_accounts WHERE id = $1")
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let previous: Option<Decimal> =
            sqlx::query("SELECT balance FROM credit_accounts WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .map(|row| row.try_get("balance"))
                .transpose()
                .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO credit_accounts (id, balance) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET balance = $2, updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(new_balance)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, NOW()))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(amount)
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(&entry.actor)
        .bind(new_balance)
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
            "INSERT INTO credit_accounts (id, balance) VALUES ($1, 0) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT balance FROM credit_accounts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let current: Decimal = row.try_get("balance").map_err(db_err)?;

        let deducted = current.min(amount);
        let new_balance = (current - amount).max(Decimal::ZERO);

        sqlx::query("UPDATE credit_accounts SET balance = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(new_balance)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (account_id, amount, kind, reason, actor, balance_after,
                 model_id, prompt_tokens, completion_tokens, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, NOW()))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(-deducted)
        .bind(entry.kind.as_str())
        .bind(&entry.reason)
        .bind(&entry.actor)
        .bind(new_balance)
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = $2, default_credits = $3, is_baseline = $4, updated_at = NOW()
            "#,
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(group.default_credits)
        .bind(group.is_baseline)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_group(&self, id: &str) -> StoreResult<Option<Group>> {
        let row = sqlx::query("SELECT * FROM credit_groups WHERE id = $1")
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
        sqlx::query("DELETE FROM credit_memberships WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for group_id in group_ids {
            sqlx::query(
                r#"
                INSERT INTO credit_memberships (account_id, group_id)
                VALUES ($1, $2) ON CONFLICT DO NOTHING
                "#,
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
            "SELECT group_id FROM credit_memberships WHERE account_id = $1 ORDER BY group_id",
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = $2, context_price = $3, generation_price = $4,
                is_free = $5, is_available = $6, is_restricted = $7, updated_at = NOW()
            "#,
        )
        .bind(&model.id)
        .bind(&model.name)
        .bind(model.context_price)
        .bind(model.generation_price)
        .bind(model.is_free)
        .bind(model.is_available)
        .bind(model.is_restricted)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_model(&self, id: &str) -> StoreResult<Option<Model>> {
        let row = sqlx::query("SELECT * FROM credit_models WHERE id = $1")
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
                    SELECT * FROM credit_transactions WHERE account_id = $1
                    ORDER BY id DESC LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(account_id)
                .bind(i64::from(limit))
                .bind(i64::from(offset))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM credit_transactions ORDER BY id DESC LIMIT $1 OFFSET $2",
                )
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
            SELECT models_used FROM credit_usage_statistics
            WHERE account_id = $1 AND year = $2 AND month = $3 FOR UPDATE
            "#,
        )
        .bind(account_id)
        .bind(year)
        .bind(month as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut models: BTreeSet<String> = match &row {
            Some(row) => {
                let raw: String = row.try_get("models_used").map_err(db_err)?;
                serde_json::from_str(&raw)?
            }
            None => BTreeSet::new(),
        };
        if let Some(model_id) = model_id {
            models.insert(model_id.to_string());
        }
        let models_json = serde_json::to_string(&models)?;

        if row.is_some() {
            sqlx::query(
                r#"
                UPDATE credit_usage_statistics
                SET credits_used = credits_used + $4,
                    transactions_count = transactions_count + 1,
                    models_used = $5,
                    updated_at = NOW()
                WHERE account_id = $1 AND year = $2 AND month = $3
                "#,
            )
            .bind(account_id)
            .bind(year)
            .bind(month as i32)
            .bind(credits)
            .bind(&models_json)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO credit_usage_statistics
                    (account_id, year, month, credits_used, transactions_count, models_used)
                VALUES ($1, $2, $3, $4, 1, $5)
                "#,
            )
            .bind(account_id)
            .bind(year)
            .bind(month as i32)
            .bind(credits)
            .bind(&models_json)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
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
            SELECT * FROM credit_usage_statistics WHERE account_id = $1
            ORDER BY year DESC, month DESC LIMIT $2
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
            SELECT * FROM credit_usage_statistics WHERE year = $1 AND month = $2
            ORDER BY credits_used DESC
            "#,
        )
        .bind(year)
        .bind(month as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(statistic_from_row).collect()
    }

    async fn statistics_for_year(&self, year: i32) -> StoreResult<Vec<UsageStatistic>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM credit_usage_statistics WHERE year = $1
            ORDER BY month, account_id
            "#,
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
            SET balance_before_reset = $4, updated_at = NOW()
            WHERE account_id = $1 AND year = $2 AND month = $3
            "#,
        )
        .bind(account_id)
        .bind(year)
        .bind(month as i32)
        .bind(balance)
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
            INSERT INTO credit_usage_statistics (account_id, year, month)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id, year, month) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(year)
        .bind(month as i32)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&event.reset_type)
        .bind(event.reset_date)
        .bind(month)
        .bind(event.users_affected)
        .bind(event.total_credits_granted)
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
            SET users_affected = $2, total_credits_granted = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(users_affected)
        .bind(total_credits_granted)
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
            "UPDATE credit_reset_events SET status = 'failed', error_message = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error_message)
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
            WHERE reset_type = $1 AND status = 'completed'
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
        let rows = sqlx::query("SELECT * FROM credit_reset_events ORDER BY id DESC LIMIT $1")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM credit_settings WHERE key = $1")
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
            INSERT INTO credit_settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()
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
