use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::payout::PayoutResolution;
use crate::store::models::{wei, AllocationRecord, PayoutMethod, PayoutRecord};

// ========== REQUEST MODELS ==========

/// Manual allocation set for an event
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAllocationRequest {
    pub event_id: u64,
    pub org_ids: Vec<u64>,
    /// Wider than u16 so out-of-range values are reported, not rejected by serde
    pub splits_bps: Vec<u64>,
    pub approved_by: String,
}

/// Off-chain donation accepted with its funding tx hash
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDonationRequest {
    pub event_id: u64,
    pub org_id: u64,
    pub donor_address: String,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub tx_hash: String,
    #[serde(default)]
    pub block_number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRequest {
    pub id: u64,
    pub name: String,
    pub country: String,
    pub payout_method: PayoutMethod,
    #[serde(default)]
    pub allowlisted: bool,
}

/// Settle a payout left `processing`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePayoutRequest {
    pub payout_id: i64,
    #[serde(flatten)]
    pub resolution: PayoutResolution,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResponse {
    pub event_id: u64,
    pub allocations: Vec<AllocationRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDonationResponse {
    pub tx_hash: String,
    /// false when the tx hash was already recorded
    pub inserted: bool,
}

/// Ledger of one event: what came in, what went out
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayoutsResponse {
    pub event_id: u64,
    #[serde(with = "wei")]
    pub donated_wei: U256,
    #[serde(with = "wei")]
    pub paid_wei: U256,
    #[serde(with = "wei")]
    pub remaining_wei: U256,
    pub payouts: Vec<PayoutRecord>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub last_processed_block: Option<u64>,
    pub offramp_available: bool,
}
