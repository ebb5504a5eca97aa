// Settlement Store - durable state shared by the indexer and the payout engine
pub mod memory;
pub mod models;
pub mod postgres;

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::error::AppResult;
use models::*;

pub use memory::InMemorySettlementStore;
pub use postgres::PgSettlementStore;

/// Storage seam for cursor, donations, allocations and payouts
///
/// INVARIANTS every implementation upholds:
/// - `donations.tx_hash` is unique; replays are no-ops
/// - an allocation set is replaced as a whole, never observed half-written
/// - the cursor never moves backwards and is written with the chunk it covers
/// - processing + completed payouts of an event never exceed its donations
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn cursor(&self) -> AppResult<IndexCursor>;

    /// Apply one decoded block range and advance the cursor to `batch.to_block`
    /// in a single atomic write. Order: donations, allocations, payouts.
    async fn apply_chunk(&self, batch: &ChunkBatch) -> AppResult<ChunkOutcome>;

    /// Returns false when the tx hash was already recorded
    async fn insert_donation(&self, donation: &NewDonation) -> AppResult<bool>;

    async fn replace_allocations(
        &self,
        update: &AllocationUpdate,
    ) -> AppResult<Vec<AllocationRecord>>;

    /// Store a derived proportional set unless a manual set exists for the
    /// event, checked in the same atomic write. Returns false when a manual
    /// set was found and left in place.
    async fn replace_proportional_allocations(&self, update: &AllocationUpdate) -> AppResult<bool>;

    /// Ordered by org id
    async fn allocations_for_event(&self, event_id: u64) -> AppResult<Vec<AllocationRecord>>;

    async fn donations_for_event(&self, event_id: u64) -> AppResult<Vec<DonationRecord>>;

    /// Lifetime donated wei per org, ordered by org id
    async fn donation_totals_by_org(&self, event_id: u64) -> AppResult<Vec<(u64, U256)>>;

    /// Ordered by id (insertion order)
    async fn payouts_for_event(&self, event_id: u64) -> AppResult<Vec<PayoutRecord>>;

    /// Compare-and-commit: inserts a `processing` row only if the event still
    /// has `amount_wei` undistributed, counting processing and completed rows.
    async fn reserve_payout(&self, payout: &NewPayout) -> AppResult<PayoutRecord>;

    async fn complete_payout(
        &self,
        payout_id: i64,
        settlement: &PayoutSettlement,
    ) -> AppResult<PayoutRecord>;

    async fn fail_payout(&self, payout_id: i64, reason: &str) -> AppResult<PayoutRecord>;

    async fn organization(&self, org_id: u64) -> AppResult<Option<Organization>>;

    async fn upsert_organization(&self, organization: &Organization) -> AppResult<()>;
}

/// Sum a list of wei amounts, rejecting overflow
pub fn sum_wei<'a>(amounts: impl IntoIterator<Item = &'a U256>) -> AppResult<U256> {
    amounts.into_iter().try_fold(U256::ZERO, |acc, amount| {
        acc.checked_add(*amount).ok_or_else(|| {
            crate::error::IntegrityError::ValueOutOfRange {
                field: "amount_wei sum",
                value: "overflow".to_string(),
            }
            .into()
        })
    })
}
