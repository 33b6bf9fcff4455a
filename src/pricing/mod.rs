//! Model pricing and group allowance resolution.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::warn;

use crate::store::{CreditStore, StoreError};
use crate::types::{Group, Model};

/// Group id every account implicitly belongs to.
pub const BASELINE_GROUP_ID: &str = "default";
/// Display name used when the baseline group has to be created.
pub const BASELINE_GROUP_NAME: &str = "Users";
/// Monthly allowance of the baseline group when nothing else is configured.
pub const BASELINE_GROUP_CREDITS: Decimal = dec!(1000);

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("model not found: {id}")]
    ModelNotFound { id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type PricingResult<T> = std::result::Result<T, PricingError>;

/// Resolves token costs from per-model prices and monthly allowances
/// from group memberships.
#[derive(Clone)]
pub struct PricingResolver {
    store: Arc<dyn CreditStore>,
}

impl PricingResolver {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Credit cost of one inference call against a known model record.
    ///
    /// Free models always cost zero regardless of their price fields.
    pub fn cost_of(model: &Model, prompt_tokens: i64, completion_tokens: i64) -> Decimal {
        if model.is_free {
            return Decimal::ZERO;
        }
        Decimal::from(prompt_tokens) * model.context_price
            + Decimal::from(completion_tokens) * model.generation_price
    }

    /// Cost lookup by model id. An unknown model is a hard error so a
    /// misconfigured gateway cannot silently serve for free.
    pub async fn cost_for(
        &self,
        model_id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> PricingResult<Decimal> {
        let model = self.model(model_id).await?;
        Ok(Self::cost_of(&model, prompt_tokens, completion_tokens))
    }

    pub async fn model(&self, model_id: &str) -> PricingResult<Model> {
        self.store
            .get_model(model_id)
            .await?
            .ok_or_else(|| PricingError::ModelNotFound {
                id: model_id.to_string(),
            })
    }

    pub async fn register_model(&self, model: &Model) -> PricingResult<()> {
        self.store.upsert_model(model).await?;
        Ok(())
    }

    pub async fn list_models(&self) -> PricingResult<Vec<Model>> {
        Ok(self.store.list_models().await?)
    }

    /// Monthly allowance for an account: the baseline group's credits
    /// plus the credits of every non-baseline group the account belongs
    /// to. The baseline is counted exactly once even when the account
    /// carries an explicit membership row for it.
    pub async fn resolve_allowance(&self, account_id: &str) -> PricingResult<Decimal> {
        let mut total = match self.store.get_group(BASELINE_GROUP_ID).await? {
            Some(baseline) => baseline.default_credits,
            None => {
                warn!(account_id, "baseline group missing; contributing zero");
                Decimal::ZERO
            }
        };

        for group_id in self.store.memberships(account_id).await? {
            if group_id == BASELINE_GROUP_ID {
                continue;
            }
            match self.store.get_group(&group_id).await? {
                Some(group) => total += group.default_credits,
                None => {
                    warn!(account_id, group_id, "membership references unknown group");
                }
            }
        }

        Ok(total)
    }

    /// Names of the groups contributing to an account's allowance,
    /// baseline first.
    pub async fn group_names_for(&self, account_id: &str) -> PricingResult<Vec<String>> {
        let mut names = Vec::new();
        if let Some(baseline) = self.store.get_group(BASELINE_GROUP_ID).await? {
            names.push(baseline.name);
        }
        for group_id in self.store.memberships(account_id).await? {
            if group_id == BASELINE_GROUP_ID {
                continue;
            }
            if let Some(group) = self.store.get_group(&group_id).await? {
                names.push(group.name);
            }
        }
        Ok(names)
    }

    /// Create the baseline group if it does not exist yet. Returns true
    /// when it was created.
    pub async fn ensure_baseline_group(&self) -> PricingResult<bool> {
        if self.store.get_group(BASELINE_GROUP_ID).await?.is_some() {
            return Ok(false);
        }
        let group = Group::baseline(
            BASELINE_GROUP_ID,
            BASELINE_GROUP_NAME,
            BASELINE_GROUP_CREDITS,
        );
        self.store.upsert_group(&group).await?;
        Ok(true)
    }

    /// Update a group's monthly allowance, creating the group when
    /// absent. `is_baseline` on an existing group is preserved.
    pub async fn set_group_allowance(
        &self,
        group_id: &str,
        name: &str,
        default_credits: Decimal,
    ) -> PricingResult<()> {
        let group = match self.store.get_group(group_id).await? {
            Some(mut existing) => {
                existing.name = name.to_string();
                existing.default_credits = default_credits;
                existing
            }
            None => Group::new(group_id, name, default_credits),
        };
        self.store.upsert_group(&group).await?;
        Ok(())
    }

    pub async fn list_groups(&self) -> PricingResult<Vec<Group>> {
        Ok(self.store.list_groups().await?)
    }

    pub async fn replace_memberships(
        &self,
        account_id: &str,
        group_ids: &[String],
    ) -> PricingResult<()> {
        self.store.replace_memberships(account_id, group_ids).await?;
        Ok(())
    }
}
