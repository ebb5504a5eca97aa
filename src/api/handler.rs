use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::*;
use crate::{
    error::{AppError, AppResult, IntegrityError},
    indexer::{ChainIndexer, IndexerRunResult, IndexerStatus},
    offramp::OfframpAdapter,
    payout::{PayoutEngine, PayoutExecResult, PayoutPreview},
    store::{
        models::{
            AllocationSource, AllocationUpdate, NewDonation, Organization, PayoutRecord,
            PayoutStatus, Split,
        },
        sum_wei, SettlementStore,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SettlementStore>,
    pub indexer: Arc<ChainIndexer>,
    pub payout_engine: Arc<PayoutEngine>,
    pub offramp: Arc<dyn OfframpAdapter>,
    /// Required in `x-api-key` on trigger and write routes when set
    pub api_key: Option<Arc<str>>,
}

// ========== TRIGGERS ==========

/// Run the chain indexer once
/// POST /indexer/run
pub async fn run_indexer(State(state): State<AppState>) -> AppResult<Json<IndexerRunResult>> {
    let result = state.indexer.run().await?;
    Ok(Json(result))
}

/// GET /indexer/status
pub async fn indexer_status(State(state): State<AppState>) -> AppResult<Json<IndexerStatus>> {
    Ok(Json(state.indexer.status().await?))
}

/// Distribute an event's undistributed balance
/// POST /payouts/:event_id/execute
pub async fn execute_payout(
    State(state): State<AppState>,
    Path(event_id): Path<u64>,
) -> AppResult<Json<PayoutExecResult>> {
    info!("Payout requested for event {}", event_id);
    let result = state.payout_engine.execute_payout(event_id).await?;
    Ok(Json(result))
}

/// Resolve a payout an interrupted execution left in flight
/// POST /payouts/:event_id/reconcile
pub async fn reconcile_payout(
    State(state): State<AppState>,
    Path(event_id): Path<u64>,
    Json(request): Json<ReconcilePayoutRequest>,
) -> AppResult<Json<PayoutRecord>> {
    let record = state
        .payout_engine
        .reconcile_payout(event_id, request.payout_id, request.resolution)
        .await?;
    Ok(Json(record))
}

/// GET /payouts/:event_id/quote
pub async fn preview_payout(
    State(state): State<AppState>,
    Path(event_id): Path<u64>,
) -> AppResult<Json<PayoutPreview>> {
    Ok(Json(state.payout_engine.preview_payout(event_id).await?))
}

/// GET /payouts/:event_id
pub async fn list_payouts(
    State(state): State<AppState>,
    Path(event_id): Path<u64>,
) -> AppResult<Json<EventPayoutsResponse>> {
    let totals = state.store.donation_totals_by_org(event_id).await?;
    let donated_wei = sum_wei(totals.iter().map(|(_, amount)| amount))?;

    let payouts = state.store.payouts_for_event(event_id).await?;
    let paid_wei = sum_wei(
        payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Completed)
            .map(|p| &p.amount_wei),
    )?;

    Ok(Json(EventPayoutsResponse {
        event_id,
        donated_wei,
        paid_wei,
        remaining_wei: donated_wei.saturating_sub(paid_wei),
        payouts,
    }))
}

// ========== WRITES ==========

/// Replace an event's allocation with a manual set
/// POST /allocations
pub async fn set_allocation(
    State(state): State<AppState>,
    Json(request): Json<SetAllocationRequest>,
) -> AppResult<Json<AllocationResponse>> {
    let update = allocation_update(request)?;
    let allocations = state.store.replace_allocations(&update).await?;

    info!(
        "📋 Allocation for event {} set by {} ({} org(s))",
        update.event_id,
        update.approved_by,
        allocations.len()
    );

    Ok(Json(AllocationResponse {
        event_id: update.event_id,
        allocations,
    }))
}

fn allocation_update(request: SetAllocationRequest) -> AppResult<AllocationUpdate> {
    if request.approved_by.trim().is_empty() {
        return Err(AppError::InvalidInput("approvedBy is required".to_string()));
    }
    if request.org_ids.len() != request.splits_bps.len() {
        return Err(IntegrityError::MalformedAllocation {
            event_id: request.event_id,
            reason: format!(
                "{} org ids but {} splits",
                request.org_ids.len(),
                request.splits_bps.len()
            ),
        }
        .into());
    }

    let splits = request
        .org_ids
        .iter()
        .zip(&request.splits_bps)
        .map(|(&org_id, &bps)| {
            let split_bps = u16::try_from(bps).map_err(|_| IntegrityError::ValueOutOfRange {
                field: "splitsBps",
                value: bps.to_string(),
            })?;
            Ok(Split { org_id, split_bps })
        })
        .collect::<AppResult<Vec<_>>>()?;

    let update = AllocationUpdate {
        event_id: request.event_id,
        splits,
        source: AllocationSource::Manual,
        approved_by: request.approved_by,
        tx_hash: None,
    };
    update.validate()?;
    Ok(update)
}

/// Record an off-chain donation; replays of the same tx hash are no-ops
/// POST /donations
pub async fn record_donation(
    State(state): State<AppState>,
    Json(request): Json<RecordDonationRequest>,
) -> AppResult<(StatusCode, Json<RecordDonationResponse>)> {
    let tx_hash = request.tx_hash.trim().to_lowercase();
    if tx_hash.is_empty() {
        return Err(AppError::InvalidInput("txHash is required".to_string()));
    }
    if request.amount_wei.is_zero() {
        return Err(AppError::InvalidInput("amountWei must be positive".to_string()));
    }

    let donation = NewDonation {
        event_id: request.event_id,
        org_id: request.org_id,
        donor_address: request.donor_address.trim().to_lowercase(),
        amount_wei: request.amount_wei,
        tx_hash: tx_hash.clone(),
        block_number: request.block_number,
    };
    let inserted = state.store.insert_donation(&donation).await?;

    let status = if inserted {
        info!(
            "💰 Donation {} recorded: {} wei to event {} / org {}",
            tx_hash, donation.amount_wei, donation.event_id, donation.org_id
        );
        StatusCode::CREATED
    } else {
        warn!("Donation {} already recorded", tx_hash);
        StatusCode::OK
    };

    Ok((status, Json(RecordDonationResponse { tx_hash, inserted })))
}

/// POST /organizations
pub async fn upsert_organization(
    State(state): State<AppState>,
    Json(request): Json<OrganizationRequest>,
) -> AppResult<Json<Organization>> {
    if request.name.trim().is_empty() {
        return Err(AppError::InvalidInput("name is required".to_string()));
    }

    let organization = Organization {
        id: request.id,
        name: request.name.trim().to_string(),
        country: request.country.trim().to_string(),
        payout_method: request.payout_method,
        allowlisted: request.allowlisted,
    };
    state.store.upsert_organization(&organization).await?;
    Ok(Json(organization))
}

/// Health check endpoint
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let last_processed_block = match state.store.cursor().await {
        Ok(cursor) => Some(cursor.last_processed_block),
        Err(e) => {
            warn!("Health check: store unavailable: {}", e);
            None
        }
    };
    let offramp_available = state.offramp.is_available().await.unwrap_or(false);

    let status = if last_processed_block.is_some() && offramp_available {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        last_processed_block,
        offramp_available,
    })
}
