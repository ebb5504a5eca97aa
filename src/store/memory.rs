use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use super::models::*;
use super::{sum_wei, SettlementStore};
use crate::error::{AppError, AppResult, IntegrityError};

#[derive(Default)]
struct StoreState {
    cursor: Option<IndexCursor>,
    donations: Vec<DonationRecord>,
    donation_hashes: HashSet<String>,
    allocations: HashMap<u64, Vec<AllocationRecord>>,
    payouts: Vec<PayoutRecord>,
    organizations: BTreeMap<u64, Organization>,
    next_donation_id: i64,
    next_payout_id: i64,
}

impl StoreState {
    fn insert_donation(&mut self, donation: &NewDonation) -> bool {
        if !self.donation_hashes.insert(donation.tx_hash.clone()) {
            return false;
        }
        self.next_donation_id += 1;
        self.donations.push(DonationRecord {
            id: self.next_donation_id,
            event_id: donation.event_id,
            org_id: donation.org_id,
            donor_address: donation.donor_address.clone(),
            amount_wei: donation.amount_wei,
            tx_hash: donation.tx_hash.clone(),
            block_number: donation.block_number,
            created_at: Utc::now(),
        });
        true
    }

    fn replace_allocations(&mut self, update: &AllocationUpdate) -> Vec<AllocationRecord> {
        let mut records = update.clone().into_records(Utc::now());
        records.sort_by_key(|r| r.org_id);
        self.allocations.insert(update.event_id, records.clone());
        records
    }

    /// Returns (inserted, reconciled)
    fn record_receipt(&mut self, receipt: &ChainPayoutReceipt) -> (bool, bool) {
        if self
            .payouts
            .iter()
            .any(|p| p.tx_hash.as_deref() == Some(receipt.tx_hash.as_str()))
        {
            return (false, false);
        }

        if !receipt.offramp_ref.is_empty() {
            let pending_match = self.payouts.iter_mut().find(|p| {
                p.event_id == receipt.event_id
                    && p.org_id == receipt.org_id
                    && p.tx_hash.is_none()
                    && p.offramp_ref.as_deref() == Some(receipt.offramp_ref.as_str())
                    && matches!(p.status, PayoutStatus::Processing | PayoutStatus::Completed)
            });
            if let Some(payout) = pending_match {
                payout.tx_hash = Some(receipt.tx_hash.clone());
                payout.status = PayoutStatus::Completed;
                payout.updated_at = Utc::now();
                return (false, true);
            }
        }

        // A crash between the off-ramp call and completion leaves the row
        // processing without a reference; the receipt settles it
        let stuck = self.payouts.iter_mut().find(|p| {
            p.event_id == receipt.event_id
                && p.org_id == receipt.org_id
                && p.tx_hash.is_none()
                && p.status == PayoutStatus::Processing
                && p.amount_wei == receipt.amount_wei
        });
        if let Some(payout) = stuck {
            payout.tx_hash = Some(receipt.tx_hash.clone());
            payout.offramp_ref = Some(receipt.offramp_ref.clone());
            payout.fiat_currency = receipt.fiat_currency.clone();
            payout.fiat_amount = receipt.fiat_amount.clone();
            payout.status = PayoutStatus::Completed;
            payout.updated_at = Utc::now();
            return (false, true);
        }

        self.next_payout_id += 1;
        let now = Utc::now();
        self.payouts.push(PayoutRecord {
            id: self.next_payout_id,
            event_id: receipt.event_id,
            org_id: receipt.org_id,
            amount_wei: receipt.amount_wei,
            fiat_currency: receipt.fiat_currency.clone(),
            fiat_amount: receipt.fiat_amount.clone(),
            offramp_ref: Some(receipt.offramp_ref.clone()),
            status: PayoutStatus::Completed,
            tx_hash: Some(receipt.tx_hash.clone()),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        });
        (true, false)
    }

    fn transition(
        &mut self,
        payout_id: i64,
        to: PayoutStatus,
    ) -> AppResult<&mut PayoutRecord> {
        let payout = self
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id)
            .ok_or_else(|| AppError::NotFound(format!("Payout {} not found", payout_id)))?;

        if payout.status != PayoutStatus::Processing {
            return Err(IntegrityError::InvalidPayoutTransition {
                id: payout_id,
                from: payout.status.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        payout.status = to;
        payout.updated_at = Utc::now();
        Ok(payout)
    }
}

/// Process-local store behind a single lock; every operation is atomic.
pub struct InMemorySettlementStore {
    state: RwLock<StoreState>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }
}

impl Default for InMemorySettlementStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn cursor(&self) -> AppResult<IndexCursor> {
        let state = self.state.read().await;
        Ok(state.cursor.clone().unwrap_or_else(IndexCursor::genesis))
    }

    async fn apply_chunk(&self, batch: &ChunkBatch) -> AppResult<ChunkOutcome> {
        // Validate before touching state so a bad set leaves the chunk unapplied
        for update in &batch.allocations {
            update.validate()?;
        }

        let mut state = self.state.write().await;
        let last = state
            .cursor
            .as_ref()
            .map(|c| c.last_processed_block)
            .unwrap_or(0);
        if batch.is_stale(last) {
            debug!(
                "Skipping blocks {}..={}: cursor already at {}",
                batch.from_block, batch.to_block, last
            );
            return Ok(ChunkOutcome::stale());
        }

        let mut outcome = ChunkOutcome::default();

        for donation in &batch.donations {
            if state.insert_donation(donation) {
                outcome.donations_inserted += 1;
            }
        }
        for update in &batch.allocations {
            state.replace_allocations(update);
            outcome.allocation_sets_applied += 1;
        }
        for receipt in &batch.payouts {
            let (inserted, reconciled) = state.record_receipt(receipt);
            outcome.payouts_inserted += usize::from(inserted);
            outcome.payouts_reconciled += usize::from(reconciled);
        }

        state.cursor = Some(IndexCursor {
            last_processed_block: last.max(batch.to_block),
            updated_at: Utc::now(),
        });

        debug!(
            "Applied blocks {}..={} in memory: {:?}",
            batch.from_block, batch.to_block, outcome
        );
        Ok(outcome)
    }

    async fn insert_donation(&self, donation: &NewDonation) -> AppResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.insert_donation(donation))
    }

    async fn replace_allocations(
        &self,
        update: &AllocationUpdate,
    ) -> AppResult<Vec<AllocationRecord>> {
        update.validate()?;
        let mut state = self.state.write().await;
        Ok(state.replace_allocations(update))
    }

    async fn replace_proportional_allocations(&self, update: &AllocationUpdate) -> AppResult<bool> {
        update.validate()?;
        let mut state = self.state.write().await;
        let has_manual = state
            .allocations
            .get(&update.event_id)
            .is_some_and(|set| set.iter().any(|a| a.source == AllocationSource::Manual));
        if has_manual {
            return Ok(false);
        }
        state.replace_allocations(update);
        Ok(true)
    }

    async fn allocations_for_event(&self, event_id: u64) -> AppResult<Vec<AllocationRecord>> {
        let state = self.state.read().await;
        Ok(state.allocations.get(&event_id).cloned().unwrap_or_default())
    }

    async fn donations_for_event(&self, event_id: u64) -> AppResult<Vec<DonationRecord>> {
        let state = self.state.read().await;
        Ok(state
            .donations
            .iter()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn donation_totals_by_org(&self, event_id: u64) -> AppResult<Vec<(u64, U256)>> {
        let state = self.state.read().await;
        let mut totals: BTreeMap<u64, U256> = BTreeMap::new();
        for donation in state.donations.iter().filter(|d| d.event_id == event_id) {
            let entry = totals.entry(donation.org_id).or_insert(U256::ZERO);
            *entry = sum_wei([&*entry, &donation.amount_wei])?;
        }
        Ok(totals.into_iter().collect())
    }

    async fn payouts_for_event(&self, event_id: u64) -> AppResult<Vec<PayoutRecord>> {
        let state = self.state.read().await;
        Ok(state
            .payouts
            .iter()
            .filter(|p| p.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn reserve_payout(&self, payout: &NewPayout) -> AppResult<PayoutRecord> {
        let mut state = self.state.write().await;

        let donated = sum_wei(
            state
                .donations
                .iter()
                .filter(|d| d.event_id == payout.event_id)
                .map(|d| &d.amount_wei),
        )?;
        let committed = sum_wei(
            state
                .payouts
                .iter()
                .filter(|p| {
                    p.event_id == payout.event_id
                        && matches!(p.status, PayoutStatus::Processing | PayoutStatus::Completed)
                })
                .map(|p| &p.amount_wei),
        )?;
        let available = donated.saturating_sub(committed);
        if payout.amount_wei > available {
            return Err(IntegrityError::OverDistribution {
                event_id: payout.event_id,
                requested: payout.amount_wei.to_string(),
                available: available.to_string(),
            }
            .into());
        }

        state.next_payout_id += 1;
        let now = Utc::now();
        let record = PayoutRecord {
            id: state.next_payout_id,
            event_id: payout.event_id,
            org_id: payout.org_id,
            amount_wei: payout.amount_wei,
            fiat_currency: payout.fiat_currency.clone(),
            fiat_amount: "0".to_string(),
            offramp_ref: None,
            status: PayoutStatus::Processing,
            tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.payouts.push(record.clone());
        Ok(record)
    }

    async fn complete_payout(
        &self,
        payout_id: i64,
        settlement: &PayoutSettlement,
    ) -> AppResult<PayoutRecord> {
        let mut state = self.state.write().await;
        let payout = state.transition(payout_id, PayoutStatus::Completed)?;
        payout.fiat_currency = settlement.fiat_currency.clone();
        payout.fiat_amount = settlement.fiat_amount.clone();
        payout.offramp_ref = Some(settlement.offramp_ref.clone());
        Ok(payout.clone())
    }

    async fn fail_payout(&self, payout_id: i64, reason: &str) -> AppResult<PayoutRecord> {
        let mut state = self.state.write().await;
        let payout = state.transition(payout_id, PayoutStatus::Failed)?;
        payout.failure_reason = Some(reason.to_string());
        Ok(payout.clone())
    }

    async fn organization(&self, org_id: u64) -> AppResult<Option<Organization>> {
        let state = self.state.read().await;
        Ok(state.organizations.get(&org_id).cloned())
    }

    async fn upsert_organization(&self, organization: &Organization) -> AppResult<()> {
        let mut state = self.state.write().await;
        state
            .organizations
            .insert(organization.id, organization.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donation(tx: &str, event_id: u64, org_id: u64, amount: u64) -> NewDonation {
        NewDonation {
            event_id,
            org_id,
            donor_address: "0x00000000000000000000000000000000000000d0".to_string(),
            amount_wei: U256::from(amount),
            tx_hash: tx.to_string(),
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn test_duplicate_donation_is_noop() {
        let store = InMemorySettlementStore::new();
        assert!(store.insert_donation(&donation("0xaa", 1, 1, 10)).await.unwrap());
        assert!(!store.insert_donation(&donation("0xaa", 1, 1, 10)).await.unwrap());
        assert_eq!(store.donations_for_event(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_back() {
        let store = InMemorySettlementStore::new();
        let ahead = ChunkBatch {
            from_block: 1,
            to_block: 900,
            ..Default::default()
        };
        store.apply_chunk(&ahead).await.unwrap();

        let behind = ChunkBatch {
            from_block: 1,
            to_block: 400,
            donations: vec![donation("0xee", 1, 1, 5)],
            ..Default::default()
        };
        let outcome = store.apply_chunk(&behind).await.unwrap();
        assert!(outcome.stale);
        assert_eq!(store.cursor().await.unwrap().last_processed_block, 900);
        assert!(store.donations_for_event(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_allocation_leaves_chunk_unapplied() {
        let store = InMemorySettlementStore::new();
        let batch = ChunkBatch {
            from_block: 1,
            to_block: 10,
            donations: vec![donation("0xbb", 1, 1, 5)],
            allocations: vec![AllocationUpdate {
                event_id: 1,
                splits: vec![Split { org_id: 1, split_bps: 9000 }],
                source: AllocationSource::Manual,
                approved_by: "chain".to_string(),
                tx_hash: Some("0xcc".to_string()),
            }],
            payouts: vec![],
        };

        assert!(store.apply_chunk(&batch).await.is_err());
        assert!(store.donations_for_event(1).await.unwrap().is_empty());
        assert_eq!(store.cursor().await.unwrap().last_processed_block, 0);
    }

    fn split_set(source: AllocationSource, splits: &[(u64, u16)]) -> AllocationUpdate {
        AllocationUpdate {
            event_id: 3,
            splits: splits
                .iter()
                .map(|&(org_id, split_bps)| Split { org_id, split_bps })
                .collect(),
            source,
            approved_by: "system".to_string(),
            tx_hash: None,
        }
    }

    #[tokio::test]
    async fn test_proportional_set_never_replaces_manual() {
        let store = InMemorySettlementStore::new();
        let derived = split_set(AllocationSource::Proportional, &[(1, 3000), (2, 7000)]);
        assert!(store.replace_proportional_allocations(&derived).await.unwrap());

        // re-derivation replaces an earlier proportional set
        let rederived = split_set(AllocationSource::Proportional, &[(1, 5000), (2, 5000)]);
        assert!(store.replace_proportional_allocations(&rederived).await.unwrap());
        assert_eq!(store.allocations_for_event(3).await.unwrap()[0].split_bps, 5000);

        store
            .replace_allocations(&split_set(AllocationSource::Manual, &[(1, 10000)]))
            .await
            .unwrap();
        assert!(!store.replace_proportional_allocations(&derived).await.unwrap());

        let allocations = store.allocations_for_event(3).await.unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].source, AllocationSource::Manual);
        assert_eq!(allocations[0].split_bps, 10000);
    }

    #[tokio::test]
    async fn test_reserve_rejects_over_distribution() {
        let store = InMemorySettlementStore::new();
        store.insert_donation(&donation("0x01", 4, 1, 100)).await.unwrap();

        let first = NewPayout {
            event_id: 4,
            org_id: 1,
            amount_wei: U256::from(70u64),
            fiat_currency: "USD".to_string(),
        };
        let reserved = store.reserve_payout(&first).await.unwrap();
        assert_eq!(reserved.status, PayoutStatus::Processing);

        let second = NewPayout {
            amount_wei: U256::from(31u64),
            ..first.clone()
        };
        let err = store.reserve_payout(&second).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Integrity(IntegrityError::OverDistribution { .. })
        ));

        // A failed reservation frees its amount again
        store.fail_payout(reserved.id, "bank rejected").await.unwrap();
        assert!(store.reserve_payout(&second).await.is_ok());
    }

    #[tokio::test]
    async fn test_terminal_payout_cannot_transition() {
        let store = InMemorySettlementStore::new();
        store.insert_donation(&donation("0x02", 5, 1, 100)).await.unwrap();
        let reserved = store
            .reserve_payout(&NewPayout {
                event_id: 5,
                org_id: 1,
                amount_wei: U256::from(10u64),
                fiat_currency: "USD".to_string(),
            })
            .await
            .unwrap();
        store.fail_payout(reserved.id, "timeout").await.unwrap();

        let settlement = PayoutSettlement {
            fiat_currency: "USD".to_string(),
            fiat_amount: "1.00".to_string(),
            offramp_ref: "ref".to_string(),
        };
        assert!(store.complete_payout(reserved.id, &settlement).await.is_err());
        assert_eq!(store.payouts_for_event(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_receipt_attaches_to_engine_payout() {
        let store = InMemorySettlementStore::new();
        store.insert_donation(&donation("0x03", 6, 2, 100)).await.unwrap();
        let reserved = store
            .reserve_payout(&NewPayout {
                event_id: 6,
                org_id: 2,
                amount_wei: U256::from(100u64),
                fiat_currency: "KES".to_string(),
            })
            .await
            .unwrap();
        store
            .complete_payout(
                reserved.id,
                &PayoutSettlement {
                    fiat_currency: "KES".to_string(),
                    fiat_amount: "0.00".to_string(),
                    offramp_ref: "mock_abc".to_string(),
                },
            )
            .await
            .unwrap();

        let receipt = ChainPayoutReceipt {
            event_id: 6,
            org_id: 2,
            amount_wei: U256::from(100u64),
            fiat_currency: "KES".to_string(),
            fiat_amount: "0.00".to_string(),
            offramp_ref: "mock_abc".to_string(),
            tx_hash: "0xfeed".to_string(),
            block_number: 20,
        };
        let batch = ChunkBatch {
            from_block: 11,
            to_block: 20,
            payouts: vec![receipt],
            ..Default::default()
        };
        let outcome = store.apply_chunk(&batch).await.unwrap();
        assert_eq!(outcome.payouts_reconciled, 1);
        assert_eq!(outcome.payouts_inserted, 0);

        let payouts = store.payouts_for_event(6).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].tx_hash.as_deref(), Some("0xfeed"));

        // Replaying the same range changes nothing
        let outcome = store.apply_chunk(&batch).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::stale());
        assert_eq!(store.payouts_for_event(6).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_receipt_settles_stuck_processing_row() {
        let store = InMemorySettlementStore::new();
        store.insert_donation(&donation("0x04", 5, 1, 1000)).await.unwrap();
        let stuck = store
            .reserve_payout(&NewPayout {
                event_id: 5,
                org_id: 1,
                amount_wei: U256::from(1000u64),
                fiat_currency: "USD".to_string(),
            })
            .await
            .unwrap();
        assert!(stuck.offramp_ref.is_none());

        let batch = ChunkBatch {
            from_block: 1,
            to_block: 30,
            payouts: vec![ChainPayoutReceipt {
                event_id: 5,
                org_id: 1,
                amount_wei: U256::from(1000u64),
                fiat_currency: "USD".to_string(),
                fiat_amount: "24.63".to_string(),
                offramp_ref: "mock_abc".to_string(),
                tx_hash: "0xbeef".to_string(),
                block_number: 30,
            }],
            ..Default::default()
        };
        let outcome = store.apply_chunk(&batch).await.unwrap();
        assert_eq!(outcome.payouts_reconciled, 1);
        assert_eq!(outcome.payouts_inserted, 0);

        let payouts = store.payouts_for_event(5).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].id, stuck.id);
        assert_eq!(payouts[0].status, PayoutStatus::Completed);
        assert_eq!(payouts[0].offramp_ref.as_deref(), Some("mock_abc"));
        assert_eq!(payouts[0].fiat_amount, "24.63");
    }

    #[tokio::test]
    async fn test_receipt_with_other_amount_does_not_settle_stuck_row() {
        let store = InMemorySettlementStore::new();
        store.insert_donation(&donation("0x05", 5, 1, 1000)).await.unwrap();
        store
            .reserve_payout(&NewPayout {
                event_id: 5,
                org_id: 1,
                amount_wei: U256::from(1000u64),
                fiat_currency: "USD".to_string(),
            })
            .await
            .unwrap();

        let batch = ChunkBatch {
            from_block: 1,
            to_block: 30,
            payouts: vec![ChainPayoutReceipt {
                event_id: 5,
                org_id: 1,
                amount_wei: U256::from(999u64),
                fiat_currency: "USD".to_string(),
                fiat_amount: "0.00".to_string(),
                offramp_ref: String::new(),
                tx_hash: "0xcafe".to_string(),
                block_number: 30,
            }],
            ..Default::default()
        };
        let outcome = store.apply_chunk(&batch).await.unwrap();
        assert_eq!(outcome.payouts_inserted, 1);
        let statuses: Vec<_> = store
            .payouts_for_event(5)
            .await
            .unwrap()
            .iter()
            .map(|p| p.status)
            .collect();
        assert_eq!(statuses, vec![PayoutStatus::Processing, PayoutStatus::Completed]);
    }
}
