//! Stored platform settings with typed accessors.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::store::{CreditStore, StoreResult};

/// Credits granted per unit of billing currency.
pub const CURRENCY_TO_CREDIT_RATIO: &str = "currency_to_credit_ratio";
/// Token count divisor used when prices are quoted per N tokens.
pub const TOKEN_MULTIPLIER: &str = "token_multiplier";

const DEFAULT_CURRENCY_TO_CREDIT_RATIO: Decimal = dec!(1000);
const DEFAULT_TOKEN_MULTIPLIER: u32 = 1000;

/// Key-value settings stored alongside the ledger. Unknown or
/// unparseable values fall back to defaults with a warning, so a bad
/// admin edit degrades instead of breaking billing.
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn CreditStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.store.get_setting(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.store.set_setting(key, value).await
    }

    pub async fn currency_to_credit_ratio(&self) -> StoreResult<Decimal> {
        Ok(self
            .decimal_or(CURRENCY_TO_CREDIT_RATIO, DEFAULT_CURRENCY_TO_CREDIT_RATIO)
            .await?)
    }

    pub async fn token_multiplier(&self) -> StoreResult<u32> {
        match self.store.get_setting(TOKEN_MULTIPLIER).await? {
            Some(raw) => match raw.parse::<u32>() {
                Ok(value) if value > 0 => Ok(value),
                _ => {
                    warn!(key = TOKEN_MULTIPLIER, value = %raw, "unparseable setting, using default");
                    Ok(DEFAULT_TOKEN_MULTIPLIER)
                }
            },
            None => Ok(DEFAULT_TOKEN_MULTIPLIER),
        }
    }

    /// Convert a currency amount to credits.
    pub async fn currency_to_credits(&self, amount: Decimal) -> StoreResult<Decimal> {
        Ok(amount * self.currency_to_credit_ratio().await?)
    }

    /// Convert a credit amount to currency.
    pub async fn credits_to_currency(&self, credits: Decimal) -> StoreResult<Decimal> {
        Ok(credits / self.currency_to_credit_ratio().await?)
    }

    async fn decimal_or(&self, key: &str, default: Decimal) -> StoreResult<Decimal> {
        match self.store.get_setting(key).await? {
            Some(raw) => match Decimal::from_str(&raw) {
                Ok(value) => Ok(value),
                Err(_) => {
                    warn!(key, value = %raw, "unparseable setting, using default");
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn settings() -> Settings {
        Settings::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn defaults_apply_when_unset() {
        let settings = settings();
        assert_eq!(
            settings.currency_to_credit_ratio().await.unwrap(),
            dec!(1000)
        );
        assert_eq!(settings.token_multiplier().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn stored_values_override_defaults() {
        let settings = settings();
        settings.set(CURRENCY_TO_CREDIT_RATIO, "500").await.unwrap();
        settings.set(TOKEN_MULTIPLIER, "100").await.unwrap();
        assert_eq!(
            settings.currency_to_credit_ratio().await.unwrap(),
            dec!(500)
        );
        assert_eq!(settings.token_multiplier().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn garbage_values_fall_back() {
        let settings = settings();
        settings
            .set(CURRENCY_TO_CREDIT_RATIO, "not-a-number")
            .await
            .unwrap();
        settings.set(TOKEN_MULTIPLIER, "0").await.unwrap();
        assert_eq!(
            settings.currency_to_credit_ratio().await.unwrap(),
            dec!(1000)
        );
        assert_eq!(settings.token_multiplier().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn currency_conversions_round_trip() {
        let settings = settings();
        let credits = settings.currency_to_credits(dec!(2.5)).await.unwrap();
        assert_eq!(credits, dec!(2500));
        assert_eq!(
            settings.credits_to_currency(credits).await.unwrap(),
            dec!(2.5)
        );
    }
}
