use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::traits::{OfframpAdapter, OfframpQuote, SettlementResult};
use super::wei_to_native;
use crate::error::{AppResult, OfframpError};

/// USD per native token
const MOCK_NATIVE_USD: Decimal = dec!(0.025);
const MOCK_FEE_RATE: Decimal = dec!(0.015);

/// Deterministic off-ramp for development and testnets.
///
/// Converts at a fixed native/USD rate, then through a static USD→local
/// table, and charges a flat percentage fee. No money moves.
pub struct MockOfframpAdapter {
    latency: Duration,
    usd_fx: HashMap<&'static str, Decimal>,
}

impl MockOfframpAdapter {
    pub fn new(latency: Duration) -> Self {
        let usd_fx = HashMap::from([
            ("USD", dec!(1)),
            ("KES", dec!(129)),
            ("NGN", dec!(1550)),
            ("GHS", dec!(15.5)),
            ("ZAR", dec!(18.5)),
            ("UGX", dec!(3750)),
            ("TZS", dec!(2600)),
            ("GBP", dec!(0.79)),
            ("CHF", dec!(0.88)),
            ("EUR", dec!(0.92)),
        ]);
        Self { latency, usd_fx }
    }

    fn quote(&self, amount_wei: U256, currency: &str) -> Result<OfframpQuote, OfframpError> {
        let currency = currency.to_ascii_uppercase();
        let fx = self
            .usd_fx
            .get(currency.as_str())
            .copied()
            .ok_or_else(|| OfframpError::UnsupportedCurrency(currency.clone()))?;

        let overflow = || OfframpError::InvalidAmount(amount_wei.to_string());
        let exchange_rate = MOCK_NATIVE_USD.checked_mul(fx).ok_or_else(overflow)?;
        let gross = wei_to_native(amount_wei)?
            .checked_mul(exchange_rate)
            .ok_or_else(overflow)?;
        let fee = gross.checked_mul(MOCK_FEE_RATE).ok_or_else(overflow)?;

        Ok(OfframpQuote {
            amount_wei,
            fiat_currency: currency,
            fiat_amount: to_cents(gross - fee),
            exchange_rate,
            fee: to_cents(fee),
        })
    }
}

fn to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[async_trait]
impl OfframpAdapter for MockOfframpAdapter {
    fn name(&self) -> &'static str {
        "MockOfframp"
    }

    async fn get_quote(&self, amount_wei: U256, currency: &str) -> AppResult<OfframpQuote> {
        Ok(self.quote(amount_wei, currency)?)
    }

    async fn execute(
        &self,
        amount_wei: U256,
        currency: &str,
        recipient_ref: &str,
    ) -> AppResult<SettlementResult> {
        let quote = self.quote(amount_wei, currency)?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut hasher = Sha256::new();
        hasher.update(recipient_ref.as_bytes());
        hasher.update(amount_wei.to_string().as_bytes());
        hasher.update(quote.fiat_currency.as_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());
        let reference_hash = format!("mock_{}", hex::encode(hasher.finalize()));

        debug!(
            "Mock settlement {} → {} {} ({})",
            recipient_ref, quote.fiat_amount, quote.fiat_currency, reference_hash
        );

        Ok(SettlementResult {
            success: true,
            reference_hash,
            fiat_amount: quote.fiat_amount,
            fiat_currency: quote.fiat_currency,
            timestamp: Utc::now(),
        })
    }
}
