//! Contract events mirrored by the indexer.
//!
//! Signatures are bit-exact with the deployed DonationVault,
//! AllocationRegistry and PayoutReceipt contracts; `indexed` markers only
//! affect where a field is carried (topics vs data), not the signature hash.

use alloy_primitives::{B256, U256};
use alloy_sol_types::{sol, SolEvent};

use super::client::RawLog;
use crate::error::IntegrityError;
use crate::store::models::{
    AllocationSource, AllocationUpdate, ChainPayoutReceipt, ChunkBatch, NewDonation, Split,
};

sol! {
    #[derive(Debug, PartialEq, Eq)]
    event DonationReceived(address indexed donor, uint256 indexed eventId, uint256 orgId, uint256 amount);

    #[derive(Debug, PartialEq, Eq)]
    event AllocationSet(uint256 indexed eventId, uint256[] orgIds, uint256[] splitsBps);

    #[derive(Debug, PartialEq, Eq)]
    event PayoutRecorded(
        uint256 indexed eventId,
        uint256 indexed orgId,
        uint256 amount,
        string fiatCurrency,
        string fiatAmount,
        string offrampRefHash
    );
}

/// Approver recorded for allocation sets mirrored from the registry contract
pub const CHAIN_APPROVER: &str = "chain";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DonationReceived,
    AllocationSet,
    PayoutRecorded,
}

impl EventKind {
    /// Handler order within a chunk
    pub const ALL: [EventKind; 3] = [
        EventKind::DonationReceived,
        EventKind::AllocationSet,
        EventKind::PayoutRecorded,
    ];

    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::DonationReceived => DonationReceived::SIGNATURE,
            EventKind::AllocationSet => AllocationSet::SIGNATURE,
            EventKind::PayoutRecorded => PayoutRecorded::SIGNATURE,
        }
    }

    /// topic0 of the event
    pub fn signature_hash(&self) -> B256 {
        match self {
            EventKind::DonationReceived => DonationReceived::SIGNATURE_HASH,
            EventKind::AllocationSet => AllocationSet::SIGNATURE_HASH,
            EventKind::PayoutRecorded => PayoutRecorded::SIGNATURE_HASH,
        }
    }
}

/// Where a log came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
}

impl Provenance {
    pub fn tx_hash_hex(&self) -> String {
        format!("{:#x}", self.tx_hash)
    }
}

/// One decoded contract event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    DonationReceived(Provenance, DonationReceived),
    AllocationSet(Provenance, AllocationSet),
    PayoutRecorded(Provenance, PayoutRecorded),
}

impl ChainEvent {
    pub fn decode(kind: EventKind, log: &RawLog) -> Result<Self, IntegrityError> {
        let provenance = Provenance {
            block_number: log.block_number,
            log_index: log.log_index,
            tx_hash: log.tx_hash,
        };
        let topics = log.topics.iter().copied();
        let decode_err = |e: alloy_sol_types::Error| IntegrityError::Decode {
            kind,
            tx_hash: provenance.tx_hash_hex(),
            reason: e.to_string(),
        };

        let event = match kind {
            EventKind::DonationReceived => ChainEvent::DonationReceived(
                provenance,
                DonationReceived::decode_raw_log(topics, &log.data, true).map_err(decode_err)?,
            ),
            EventKind::AllocationSet => ChainEvent::AllocationSet(
                provenance,
                AllocationSet::decode_raw_log(topics, &log.data, true).map_err(decode_err)?,
            ),
            EventKind::PayoutRecorded => ChainEvent::PayoutRecorded(
                provenance,
                PayoutRecorded::decode_raw_log(topics, &log.data, true).map_err(decode_err)?,
            ),
        };
        Ok(event)
    }

    pub fn provenance(&self) -> &Provenance {
        match self {
            ChainEvent::DonationReceived(p, _)
            | ChainEvent::AllocationSet(p, _)
            | ChainEvent::PayoutRecorded(p, _) => p,
        }
    }

    /// Convert to store rows, narrowing uint256 ids and splits
    pub fn push_into(self, batch: &mut ChunkBatch) -> Result<(), IntegrityError> {
        match self {
            ChainEvent::DonationReceived(p, ev) => {
                batch.donations.push(NewDonation {
                    event_id: narrow_u64("eventId", ev.eventId)?,
                    org_id: narrow_u64("orgId", ev.orgId)?,
                    donor_address: format!("{:#x}", ev.donor),
                    amount_wei: ev.amount,
                    tx_hash: p.tx_hash_hex(),
                    block_number: p.block_number,
                });
            }
            ChainEvent::AllocationSet(p, ev) => {
                let event_id = narrow_u64("eventId", ev.eventId)?;
                if ev.orgIds.len() != ev.splitsBps.len() {
                    return Err(IntegrityError::MalformedAllocation {
                        event_id,
                        reason: format!(
                            "{} org ids but {} splits",
                            ev.orgIds.len(),
                            ev.splitsBps.len()
                        ),
                    });
                }
                let splits = ev
                    .orgIds
                    .iter()
                    .zip(ev.splitsBps.iter())
                    .map(|(org_id, bps)| {
                        Ok(Split {
                            org_id: narrow_u64("orgId", *org_id)?,
                            split_bps: u16::try_from(*bps).map_err(|_| {
                                IntegrityError::ValueOutOfRange {
                                    field: "splitsBps",
                                    value: bps.to_string(),
                                }
                            })?,
                        })
                    })
                    .collect::<Result<Vec<_>, IntegrityError>>()?;
                batch.allocations.push(AllocationUpdate {
                    event_id,
                    splits,
                    source: AllocationSource::Manual,
                    approved_by: CHAIN_APPROVER.to_string(),
                    tx_hash: Some(p.tx_hash_hex()),
                });
            }
            ChainEvent::PayoutRecorded(p, ev) => {
                batch.payouts.push(ChainPayoutReceipt {
                    event_id: narrow_u64("eventId", ev.eventId)?,
                    org_id: narrow_u64("orgId", ev.orgId)?,
                    amount_wei: ev.amount,
                    fiat_currency: ev.fiatCurrency,
                    fiat_amount: ev.fiatAmount,
                    offramp_ref: ev.offrampRefHash,
                    tx_hash: p.tx_hash_hex(),
                    block_number: p.block_number,
                });
            }
        }
        Ok(())
    }
}

/// Ids are stored as BIGINT, so anything beyond i64::MAX is rejected here
fn narrow_u64(field: &'static str, value: U256) -> Result<u64, IntegrityError> {
    u64::try_from(value)
        .ok()
        .filter(|v| i64::try_from(*v).is_ok())
        .ok_or_else(|| IntegrityError::ValueOutOfRange {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{allocation_log, donation_log, payout_log};
    use alloy_primitives::{address, Address};

    const VAULT: Address = address!("00000000000000000000000000000000000000a1");

    #[test]
    fn test_signatures_are_bit_exact() {
        assert_eq!(
            EventKind::DonationReceived.signature(),
            "DonationReceived(address,uint256,uint256,uint256)"
        );
        assert_eq!(
            EventKind::AllocationSet.signature(),
            "AllocationSet(uint256,uint256[],uint256[])"
        );
        assert_eq!(
            EventKind::PayoutRecorded.signature(),
            "PayoutRecorded(uint256,uint256,uint256,string,string,string)"
        );
        assert_eq!(
            EventKind::DonationReceived.signature_hash(),
            alloy_primitives::keccak256("DonationReceived(address,uint256,uint256,uint256)")
        );
    }

    #[test]
    fn test_decode_donation_into_batch() {
        let donor = address!("00000000000000000000000000000000000000d0");
        let log = donation_log(VAULT, 12, 1, donor, 7, 3, U256::from(250u64));

        let event = ChainEvent::decode(EventKind::DonationReceived, &log).unwrap();
        assert_eq!(event.provenance().block_number, 12);

        let mut batch = ChunkBatch::default();
        event.push_into(&mut batch).unwrap();
        let donation = &batch.donations[0];
        assert_eq!(donation.event_id, 7);
        assert_eq!(donation.org_id, 3);
        assert_eq!(donation.amount_wei, U256::from(250u64));
        assert_eq!(
            donation.donor_address,
            "0x00000000000000000000000000000000000000d0"
        );
        assert!(donation.tx_hash.starts_with("0x"));
        assert_eq!(donation.tx_hash.len(), 66);
    }

    #[test]
    fn test_decode_with_wrong_kind_fails() {
        let log = allocation_log(VAULT, 5, 2, 1, &[(1, 10000)]);
        let err = ChainEvent::decode(EventKind::DonationReceived, &log).unwrap_err();
        assert!(matches!(
            err,
            IntegrityError::Decode {
                kind: EventKind::DonationReceived,
                ..
            }
        ));
    }

    #[test]
    fn test_allocation_split_out_of_range() {
        let log = allocation_log(VAULT, 5, 2, 1, &[(1, 70_000)]);
        let event = ChainEvent::decode(EventKind::AllocationSet, &log).unwrap();
        let mut batch = ChunkBatch::default();
        assert!(matches!(
            event.push_into(&mut batch),
            Err(IntegrityError::ValueOutOfRange { field: "splitsBps", .. })
        ));
    }

    #[test]
    fn test_payout_receipt_fields() {
        let log = payout_log(VAULT, 40, 9, 1, 2, U256::from(99u64), "KES", "120.50", "ref-1");
        let event = ChainEvent::decode(EventKind::PayoutRecorded, &log).unwrap();
        let mut batch = ChunkBatch::default();
        event.push_into(&mut batch).unwrap();
        let receipt = &batch.payouts[0];
        assert_eq!(receipt.fiat_currency, "KES");
        assert_eq!(receipt.fiat_amount, "120.50");
        assert_eq!(receipt.offramp_ref, "ref-1");
        assert_eq!(receipt.block_number, 40);
    }

    #[test]
    fn test_ids_beyond_bigint_rejected() {
        assert!(narrow_u64("eventId", U256::from(u64::MAX)).is_err());
        assert!(narrow_u64("eventId", U256::MAX).is_err());
        assert_eq!(narrow_u64("eventId", U256::from(5u64)).ok(), Some(5));
    }
}
