use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::traits::{OfframpAdapter, OfframpQuote, SettlementResult};
use crate::error::{AppResult, OfframpError};

/// REST off-ramp provider.
///
/// `GET  {base}/v1/quotes?amountWei=..&currency=..`
/// `POST {base}/v1/payouts`
pub struct HttpOfframpAdapter {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    fiat_currency: String,
    fiat_amount: Decimal,
    exchange_rate: Decimal,
    fee: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayoutRequest<'a> {
    amount_wei: String,
    currency: &'a str,
    recipient_ref: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayoutResponse {
    success: bool,
    reference: String,
    fiat_amount: Decimal,
    fiat_currency: String,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpOfframpAdapter {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OfframpError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn check(response: Response) -> Result<Response, OfframpError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(OfframpError::Unavailable(format!("HTTP {}: {}", status, body)))
        } else {
            Err(OfframpError::Rejected(format!("HTTP {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl OfframpAdapter for HttpOfframpAdapter {
    fn name(&self) -> &'static str {
        "HttpOfframp"
    }

    async fn get_quote(&self, amount_wei: U256, currency: &str) -> AppResult<OfframpQuote> {
        let amount = amount_wei.to_string();
        let response = self
            .client
            .get(format!("{}/v1/quotes", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&[("amountWei", amount.as_str()), ("currency", currency)])
            .send()
            .await
            .map_err(|e| OfframpError::Unavailable(e.to_string()))?;

        let quote: QuoteResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| OfframpError::Unavailable(format!("invalid quote body: {}", e)))?;

        Ok(OfframpQuote {
            amount_wei,
            fiat_currency: quote.fiat_currency,
            fiat_amount: quote.fiat_amount,
            exchange_rate: quote.exchange_rate,
            fee: quote.fee,
        })
    }

    async fn execute(
        &self,
        amount_wei: U256,
        currency: &str,
        recipient_ref: &str,
    ) -> AppResult<SettlementResult> {
        let request = PayoutRequest {
            amount_wei: amount_wei.to_string(),
            currency,
            recipient_ref,
        };

        info!("💸 Off-ramp payout {} wei ({}) → {}", amount_wei, currency, recipient_ref);

        let response = self
            .client
            .post(format!("{}/v1/payouts", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| OfframpError::Unavailable(e.to_string()))?;

        let payout: PayoutResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| OfframpError::Unavailable(format!("invalid payout body: {}", e)))?;

        if !payout.success {
            let reason = payout.message.unwrap_or_else(|| "provider declined".to_string());
            warn!("Off-ramp declined payout to {}: {}", recipient_ref, reason);
            return Err(OfframpError::Rejected(reason).into());
        }

        Ok(SettlementResult {
            success: true,
            reference_hash: payout.reference,
            fiat_amount: payout.fiat_amount,
            fiat_currency: payout.fiat_currency,
            timestamp: payout.completed_at.unwrap_or_else(Utc::now),
        })
    }

    async fn is_available(&self) -> AppResult<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await;
        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }
}
