use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::collections::HashSet;
use std::fmt;

use crate::error::{AppResult, IntegrityError};

/// 100% expressed in basis points
pub const TOTAL_BPS: u64 = 10_000;

/// uint256 amounts travel as decimal strings, never floats
pub mod wei {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_wei(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a base-10 uint256 string
pub fn parse_wei(raw: &str) -> Result<U256, IntegrityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IntegrityError::InvalidAmount(raw.to_string()));
    }
    U256::from_str_radix(trimmed, 10).map_err(|_| IntegrityError::InvalidAmount(raw.to_string()))
}

/// Singleton high-water mark of the chain indexer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCursor {
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl IndexCursor {
    pub fn genesis() -> Self {
        Self {
            last_processed_block: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRecord {
    pub id: i64,
    pub event_id: u64,
    pub org_id: u64,
    pub donor_address: String,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub tx_hash: String,
    pub block_number: u64,
    pub created_at: DateTime<Utc>,
}

/// Donation as observed on-chain or accepted by the donation endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDonation {
    pub event_id: u64,
    pub org_id: u64,
    pub donor_address: String,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "allocation_source", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AllocationSource {
    Manual,
    Proportional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    pub event_id: u64,
    pub org_id: u64,
    pub split_bps: u16,
    pub source: AllocationSource,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub org_id: u64,
    pub split_bps: u16,
}

/// Full replacement set for one event's allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationUpdate {
    pub event_id: u64,
    pub splits: Vec<Split>,
    pub source: AllocationSource,
    pub approved_by: String,
    pub tx_hash: Option<String>,
}

impl AllocationUpdate {
    /// A set is accepted only if it is non-empty, has no repeated org and sums to 10000 bps.
    pub fn validate(&self) -> AppResult<()> {
        if self.splits.is_empty() {
            return Err(IntegrityError::MalformedAllocation {
                event_id: self.event_id,
                reason: "empty split set".to_string(),
            }
            .into());
        }

        let mut seen = HashSet::with_capacity(self.splits.len());
        for split in &self.splits {
            if !seen.insert(split.org_id) {
                return Err(IntegrityError::MalformedAllocation {
                    event_id: self.event_id,
                    reason: format!("org {} listed twice", split.org_id),
                }
                .into());
            }
        }

        let total_bps: u64 = self.splits.iter().map(|s| u64::from(s.split_bps)).sum();
        if total_bps != TOTAL_BPS {
            return Err(IntegrityError::InvalidSplitSum {
                event_id: self.event_id,
                total_bps,
            }
            .into());
        }

        Ok(())
    }

    pub fn into_records(self, approved_at: DateTime<Utc>) -> Vec<AllocationRecord> {
        self.splits
            .iter()
            .map(|split| AllocationRecord {
                event_id: self.event_id,
                org_id: split.org_id,
                split_bps: split.split_bps,
                source: self.source,
                approved_by: self.approved_by.clone(),
                approved_at,
                tx_hash: self.tx_hash.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRecord {
    pub id: i64,
    pub event_id: u64,
    pub org_id: u64,
    #[serde(with = "wei")]
    pub amount_wei: U256,
    pub fiat_currency: String,
    pub fiat_amount: String,
    pub offramp_ref: Option<String>,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Share about to be handed to the off-ramp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayout {
    pub event_id: u64,
    pub org_id: u64,
    pub amount_wei: U256,
    pub fiat_currency: String,
}

/// Off-ramp confirmation applied to a reserved payout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutSettlement {
    pub fiat_currency: String,
    pub fiat_amount: String,
    pub offramp_ref: String,
}

/// PayoutRecorded receipt mirrored from the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPayoutReceipt {
    pub event_id: u64,
    pub org_id: u64,
    pub amount_wei: U256,
    pub fiat_currency: String,
    pub fiat_amount: String,
    pub offramp_ref: String,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    Bank,
    MobileMoney,
}

impl PayoutMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutMethod::Bank => "bank",
            PayoutMethod::MobileMoney => "mobile_money",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bank" => Some(PayoutMethod::Bank),
            "mobile_money" => Some(PayoutMethod::MobileMoney),
            _ => None,
        }
    }
}

/// Relief organization receiving payouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: u64,
    pub name: String,
    pub country: String,
    pub payout_method: PayoutMethod,
    pub allowlisted: bool,
}

/// Everything decoded from one block range, written atomically with the cursor
#[derive(Debug, Clone, Default)]
pub struct ChunkBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub donations: Vec<NewDonation>,
    pub allocations: Vec<AllocationUpdate>,
    pub payouts: Vec<ChainPayoutReceipt>,
}

impl ChunkBatch {
    pub fn log_count(&self) -> usize {
        self.donations.len() + self.allocations.len() + self.payouts.len()
    }

    /// A batch fetched before another writer committed past its start
    pub fn is_stale(&self, cursor: u64) -> bool {
        self.from_block <= cursor
    }
}

impl ChunkOutcome {
    pub fn stale() -> Self {
        Self {
            stale: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOutcome {
    /// The cursor had already passed `from_block`; nothing was written
    pub stale: bool,
    pub donations_inserted: usize,
    pub allocation_sets_applied: usize,
    pub payouts_inserted: usize,
    pub payouts_reconciled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(splits: &[(u64, u16)]) -> AllocationUpdate {
        AllocationUpdate {
            event_id: 1,
            splits: splits
                .iter()
                .map(|&(org_id, split_bps)| Split { org_id, split_bps })
                .collect(),
            source: AllocationSource::Manual,
            approved_by: "ops@relief.org".to_string(),
            tx_hash: None,
        }
    }

    #[test]
    fn test_allocation_validation() {
        assert!(update(&[(1, 6000), (2, 4000)]).validate().is_ok());
        assert!(update(&[(1, 10000)]).validate().is_ok());
        assert!(update(&[]).validate().is_err());
        assert!(update(&[(1, 6000), (2, 3999)]).validate().is_err());
        assert!(update(&[(1, 5000), (1, 5000)]).validate().is_err());
    }

    #[test]
    fn test_parse_wei() {
        assert_eq!(parse_wei("0").ok(), Some(U256::ZERO));
        assert_eq!(
            parse_wei("5000000000000000000").ok(),
            Some(U256::from(5_000_000_000_000_000_000u128))
        );
        assert!(parse_wei("-1").is_err());
        assert!(parse_wei("1.5").is_err());
        assert!(parse_wei("").is_err());
        assert!(parse_wei("0x10").is_err());
    }

    #[test]
    fn test_wei_serializes_as_decimal_string() {
        let donation = NewDonation {
            event_id: 1,
            org_id: 2,
            donor_address: "0xabc".to_string(),
            amount_wei: U256::from(1_000_000_000_000_000_000u128),
            tx_hash: "0x01".to_string(),
            block_number: 10,
        };
        let json = serde_json::to_value(&donation).unwrap();
        assert_eq!(json["amountWei"], "1000000000000000000");
    }
}
