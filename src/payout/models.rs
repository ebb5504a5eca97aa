use alloy_primitives::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::models::wei;

/// One settled share
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutLine {
    pub payout_id: i64,
    pub org_id: u64,
    pub org_name: String,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub fiat_amount: String,
    pub fiat_currency: String,
    pub reference_hash: String,
}

/// A share whose off-ramp call failed; retried on the next execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareFailure {
    pub payout_id: i64,
    pub org_id: u64,
    pub org_name: String,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub reason: String,
}

/// Share of a registered org that is not allowlisted; stays undistributed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldShare {
    pub org_id: u64,
    pub org_name: String,
    #[serde(with = "wei")]
    pub amount_wei: U256,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutExecResult {
    pub event_id: u64,
    /// Undistributed balance at the start of the execution
    #[serde(with = "wei")]
    pub total_wei: U256,
    pub payouts: Vec<PayoutLine>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ShareFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub held: Vec<HeldShare>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteLine {
    pub org_id: u64,
    pub org_name: String,
    pub split_bps: u16,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub fiat_currency: String,
    pub fiat_amount: Decimal,
    pub exchange_rate: Decimal,
    pub fee: Decimal,
}

/// Dry run of the next execution
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutPreview {
    pub event_id: u64,
    #[serde(with = "wei")]
    pub total_wei: U256,
    #[serde(with = "wei")]
    pub remaining_wei: U256,
    pub shares: Vec<QuoteLine>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub held: Vec<HeldShare>,
}

/// Operator verdict on a payout left `processing` by an interrupted execution
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PayoutResolution {
    /// The off-ramp did pay; record its confirmation
    #[serde(rename_all = "camelCase")]
    Completed {
        offramp_ref: String,
        fiat_currency: String,
        fiat_amount: String,
    },
    /// The off-ramp did not pay; the share becomes payable again
    Failed { reason: String },
}
