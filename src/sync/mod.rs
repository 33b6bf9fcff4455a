//! Import of groups, memberships, accounts, and models from an
//! external identity/model catalog.
//!
//! The importer converges the ledger toward the source: unknown records
//! are created, memberships are replaced wholesale, and operator-tuned
//! fields (group allowances, model prices) are never overwritten on
//! records that already exist.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::info;

use crate::pricing::{PricingError, PricingResolver};
use crate::store::{CreditStore, LedgerEntry, StoreError};
use crate::types::{Group, Model, TransactionKind};

/// Allowance assigned to groups first seen by the importer.
pub const DEFAULT_GROUP_CREDITS: Decimal = dec!(1000);
/// Prices assigned to models first seen by the importer.
pub const DEFAULT_CONTEXT_PRICE: Decimal = dec!(0.001);
pub const DEFAULT_GENERATION_PRICE: Decimal = dec!(0.004);

#[derive(Debug, Clone)]
pub struct GroupImport {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MembershipImport {
    pub account_id: String,
    pub group_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelImport {
    pub id: String,
    pub name: String,
}

/// Where the importer reads the upstream state from.
#[async_trait]
pub trait ImportSource: Send + Sync {
    async fn fetch_groups(&self) -> Result<Vec<GroupImport>, ImportError>;

    async fn fetch_memberships(&self) -> Result<Vec<MembershipImport>, ImportError>;

    async fn fetch_models(&self) -> Result<Vec<ModelImport>, ImportError>;
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("import source error: {0}")]
    Source(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pricing(#[from] PricingError),
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;

/// Counts of what one import run touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub groups_created: usize,
    pub memberships_updated: usize,
    pub accounts_created: usize,
    pub models_created: usize,
}

/// One-shot synchronization job.
pub struct Importer {
    store: Arc<dyn CreditStore>,
    pricing: PricingResolver,
}

impl Importer {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        let pricing = PricingResolver::new(store.clone());
        Self { store, pricing }
    }

    pub async fn run(&self, source: &dyn ImportSource) -> ImportResult<ImportSummary> {
        let mut summary = ImportSummary::default();

        self.pricing.ensure_baseline_group().await?;

        for group in source.fetch_groups().await? {
            if self.store.get_group(&group.id).await?.is_none() {
                self.store
                    .upsert_group(&Group::new(&group.id, &group.name, DEFAULT_GROUP_CREDITS))
                    .await?;
                summary.groups_created += 1;
            }
        }

        for membership in source.fetch_memberships().await? {
            self.store
                .replace_memberships(&membership.account_id, &membership.group_ids)
                .await?;
            summary.memberships_updated += 1;

            // First sight of an account seeds its balance with the full
            // monthly allowance, as if the reset had just run.
            if self.store.get_account(&membership.account_id).await?.is_none() {
                let allowance = self.pricing.resolve_allowance(&membership.account_id).await?;
                self.store
                    .set_balance(
                        &membership.account_id,
                        allowance,
                        LedgerEntry::new(TransactionKind::Sync, "sync", "Initial allocation"),
                    )
                    .await?;
                summary.accounts_created += 1;
            }
        }

        for model in source.fetch_models().await? {
            if self.store.get_model(&model.id).await?.is_none() {
                self.store
                    .upsert_model(&Model::new(
                        &model.id,
                        &model.name,
                        DEFAULT_CONTEXT_PRICE,
                        DEFAULT_GENERATION_PRICE,
                    ))
                    .await?;
                summary.models_created += 1;
            }
        }

        info!(
            groups_created = summary.groups_created,
            memberships_updated = summary.memberships_updated,
            accounts_created = summary.accounts_created,
            models_created = summary.models_created,
            "import run finished"
        );

        Ok(summary)
    }
}
