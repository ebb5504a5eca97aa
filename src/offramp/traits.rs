use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::store::models::wei;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfframpQuote {
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub fiat_currency: String,
    pub fiat_amount: Decimal,
    /// Fiat per native token
    pub exchange_rate: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub success: bool,
    pub reference_hash: String,
    pub fiat_amount: Decimal,
    pub fiat_currency: String,
    pub timestamp: DateTime<Utc>,
}

/// Fiat settlement rail. `execute` moves real money and is called at most
/// once per reserved payout.
#[async_trait]
pub trait OfframpAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_quote(&self, amount_wei: U256, currency: &str) -> AppResult<OfframpQuote>;

    async fn execute(
        &self,
        amount_wei: U256,
        currency: &str,
        recipient_ref: &str,
    ) -> AppResult<SettlementResult>;

    async fn is_available(&self) -> AppResult<bool> {
        Ok(true)
    }
}
