//! Credit ledger for a multi-tenant model-serving platform.
//!
//! Per-account credit balances with an append-only transaction log,
//! token-based pricing, monthly usage aggregation, and an idempotent
//! once-per-calendar-month allowance reset.
//!
//! [`CreditManager`] is the entry point for most callers:
//!
//! ```no_run
//! use std::sync::Arc;
//! use credit_ledger::{CreditManager, MemoryStore};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let manager = CreditManager::new(store);
//!
//! let receipt = manager.charge_tokens("alice", "gpt-a", 1200, 300, "gateway").await?;
//! println!("charged {} credits, {} remaining", receipt.deducted, receipt.new_balance);
//! # Ok(())
//! # }
//! ```
//!
//! Persistence backends are feature-gated: the in-memory store is
//! always available, `postgres` and `sqlite` enable the sqlx-backed
//! stores.

pub mod billing;
pub mod ledger;
pub mod pricing;
pub mod reset;
pub mod settings;
pub mod stats;
pub mod store;
pub mod sync;
pub mod types;

pub use billing::{BillingError, BillingResult, CreditManager};
pub use ledger::{Ledger, LedgerError};
pub use pricing::{PricingError, PricingResolver};
pub use reset::{ResetOutcome, ResetRunner, ResetScheduler, SchedulerHandle};
pub use settings::Settings;
pub use stats::UsageAggregator;
pub use store::{CreditStore, LedgerEntry, MemoryStore, StoreError, WithdrawRecord};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use sync::{ImportError, ImportSource, ImportSummary, Importer};
pub use types::{
    Account, AccountOverview, ChargeReceipt, Group, Model, MonthlySummary, ResetEvent,
    ResetStatus, Transaction, TransactionKind, UsageStatistic, YearlySummary,
};
