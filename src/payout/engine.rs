use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use super::currency::{currency_for_country, DEFAULT_CURRENCY};
use super::models::{
    HeldShare, PayoutExecResult, PayoutLine, PayoutPreview, PayoutResolution, QuoteLine,
    ShareFailure,
};
use super::split::{bps_share, proportional_split};
use crate::error::{AppError, AppResult, OfframpError, PayoutError};
use crate::offramp::OfframpAdapter;
use crate::store::models::{
    AllocationRecord, AllocationSource, AllocationUpdate, NewPayout, PayoutRecord,
    PayoutSettlement, PayoutStatus, Split,
};
use crate::store::{sum_wei, SettlementStore};

/// Approver recorded on derived proportional splits
pub const PROPORTIONAL_APPROVER: &str = "system";

/// Recipient as resolved for one share
struct Recipient {
    name: String,
    currency: String,
    allowlisted: bool,
}

impl Recipient {
    fn hold(&self, share: &PlannedShare) -> HeldShare {
        warn!(
            "Organization {} ({}) is not allowlisted, holding {} wei",
            share.org_id, self.name, share.amount_wei
        );
        HeldShare {
            org_id: share.org_id,
            org_name: self.name.clone(),
            amount_wei: share.amount_wei,
        }
    }
}

/// Share computed for one org in this round
#[derive(Debug, Clone, Copy)]
struct PlannedShare {
    org_id: u64,
    split_bps: u16,
    amount_wei: U256,
}

struct PayoutPlan {
    total_wei: U256,
    remaining_wei: U256,
    shares: Vec<PlannedShare>,
}

/// Payout Allocation Engine
///
/// Distributes an event's undistributed donations to its organizations
/// through the off-ramp, one reserved payout row per share.
///
/// INVARIANTS:
/// - executions for the same event never overlap in this process
/// - a share is reserved in the store before the off-ramp is called, so the
///   store's balance check holds across processes too
/// - completed shares are never re-sent; only unpaid entitlement is paid
pub struct PayoutEngine {
    store: Arc<dyn SettlementStore>,
    offramp: Arc<dyn OfframpAdapter>,
    offramp_timeout: Duration,
    event_locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl PayoutEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        offramp: Arc<dyn OfframpAdapter>,
        offramp_timeout: Duration,
    ) -> Self {
        Self {
            store,
            offramp,
            offramp_timeout,
            event_locks: Mutex::new(HashMap::new()),
        }
    }

    fn event_lock(&self, event_id: u64) -> Arc<tokio::sync::Mutex<()>> {
        self.event_locks
            .lock()
            .entry(event_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Pay out whatever is undistributed for `event_id`.
    ///
    /// Returns `PartialSettlement` when at least one share failed; the shares
    /// that succeeded stay completed and the failed ones are retried on the
    /// next call.
    #[instrument(skip(self), fields(offramp = self.offramp.name()))]
    pub async fn execute_payout(&self, event_id: u64) -> AppResult<PayoutExecResult> {
        let lock = self.event_lock(event_id);
        let _guard = lock.lock().await;

        let plan = self.plan(event_id, true).await?;
        info!(
            "🔄 Executing payout for event {}: {} wei undistributed across {} share(s)",
            event_id,
            plan.remaining_wei,
            plan.shares.len()
        );

        let mut result = PayoutExecResult {
            event_id,
            total_wei: plan.remaining_wei,
            payouts: Vec::new(),
            failures: Vec::new(),
            held: Vec::new(),
        };

        for share in plan.shares {
            if share.amount_wei.is_zero() {
                continue;
            }
            let recipient = self.recipient(share.org_id).await?;
            if !recipient.allowlisted {
                result.held.push(recipient.hold(&share));
                continue;
            }
            self.settle_share(event_id, share, recipient, &mut result)
                .await?;
        }

        if !result.failures.is_empty() {
            warn!(
                "⚠️ Event {} settled {} share(s), {} failed",
                event_id,
                result.payouts.len(),
                result.failures.len()
            );
            return Err(PayoutError::PartialSettlement(Box::new(result)).into());
        }

        info!(
            "✅ Event {} payout complete: {} share(s) settled",
            event_id,
            result.payouts.len()
        );
        Ok(result)
    }

    /// Quote the next execution without reserving or paying anything
    #[instrument(skip(self))]
    pub async fn preview_payout(&self, event_id: u64) -> AppResult<PayoutPreview> {
        let plan = self.plan(event_id, false).await?;

        let mut shares = Vec::with_capacity(plan.shares.len());
        let mut held = Vec::new();
        for share in plan.shares.into_iter().filter(|s| !s.amount_wei.is_zero()) {
            let recipient = self.recipient(share.org_id).await?;
            if !recipient.allowlisted {
                held.push(recipient.hold(&share));
                continue;
            }
            let quote = self
                .offramp_call(self.offramp.get_quote(share.amount_wei, &recipient.currency))
                .await?;
            shares.push(QuoteLine {
                org_id: share.org_id,
                org_name: recipient.name,
                split_bps: share.split_bps,
                amount_wei: share.amount_wei,
                fiat_currency: quote.fiat_currency,
                fiat_amount: quote.fiat_amount,
                exchange_rate: quote.exchange_rate,
                fee: quote.fee,
            });
        }

        Ok(PayoutPreview {
            event_id,
            total_wei: plan.total_wei,
            remaining_wei: plan.remaining_wei,
            shares,
            held,
        })
    }

    /// Settle a payout an interrupted execution left `processing`, after the
    /// operator has checked the off-ramp's own records
    #[instrument(skip(self, resolution))]
    pub async fn reconcile_payout(
        &self,
        event_id: u64,
        payout_id: i64,
        resolution: PayoutResolution,
    ) -> AppResult<PayoutRecord> {
        let lock = self.event_lock(event_id);
        let _guard = lock.lock().await;

        let payouts = self.store.payouts_for_event(event_id).await?;
        if !payouts.iter().any(|p| p.id == payout_id) {
            return Err(AppError::NotFound(format!(
                "Payout {} not found for event {}",
                payout_id, event_id
            )));
        }

        let record = match resolution {
            PayoutResolution::Completed {
                offramp_ref,
                fiat_currency,
                fiat_amount,
            } => {
                if offramp_ref.trim().is_empty() {
                    return Err(AppError::InvalidInput("offrampRef is required".to_string()));
                }
                self.store
                    .complete_payout(
                        payout_id,
                        &PayoutSettlement {
                            fiat_currency,
                            fiat_amount,
                            offramp_ref,
                        },
                    )
                    .await?
            }
            PayoutResolution::Failed { reason } => {
                self.store.fail_payout(payout_id, &reason).await?
            }
        };

        info!(
            "🔧 Payout {} of event {} reconciled as {}",
            payout_id, event_id, record.status
        );
        Ok(record)
    }

    /// Read balances fresh and compute this round's shares
    async fn plan(&self, event_id: u64, persist_split: bool) -> AppResult<PayoutPlan> {
        let totals = self.store.donation_totals_by_org(event_id).await?;
        let total_wei = sum_wei(totals.iter().map(|(_, amount)| amount))?;
        if total_wei.is_zero() {
            return Err(PayoutError::NoFunds(event_id).into());
        }

        let payouts = self.store.payouts_for_event(event_id).await?;

        let in_flight: Vec<i64> = payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Processing)
            .map(|p| p.id)
            .collect();
        if !in_flight.is_empty() {
            error!(
                "❌ Event {} has in-flight payouts {:?} awaiting reconciliation",
                event_id, in_flight
            );
            return Err(PayoutError::SettlementInFlight {
                event_id,
                payout_ids: in_flight,
            }
            .into());
        }

        let completed: Vec<&PayoutRecord> = payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Completed)
            .collect();
        let paid_wei = sum_wei(completed.iter().map(|p| &p.amount_wei))?;

        let remaining_wei = match total_wei.checked_sub(paid_wei) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => return Err(PayoutError::AlreadyDistributed(event_id).into()),
        };

        let mut paid_by_org: HashMap<u64, U256> = HashMap::new();
        for payout in &completed {
            let entry = paid_by_org.entry(payout.org_id).or_insert(U256::ZERO);
            *entry = entry.saturating_add(payout.amount_wei);
        }

        let splits = self.resolve_split(event_id, &totals, persist_split).await?;

        // Entitlement on the lifetime total minus what the org already
        // received, never exceeding what is left to distribute.
        let mut budget = remaining_wei;
        let mut shares = Vec::with_capacity(splits.len());
        for split in splits {
            let entitlement = bps_share(total_wei, split.split_bps)?;
            let already_paid = paid_by_org.get(&split.org_id).copied().unwrap_or_default();
            let amount_wei = entitlement.saturating_sub(already_paid).min(budget);
            budget -= amount_wei;
            shares.push(PlannedShare {
                org_id: split.org_id,
                split_bps: split.split_bps,
                amount_wei,
            });
        }

        Ok(PayoutPlan {
            total_wei,
            remaining_wei,
            shares,
        })
    }

    /// A manual allocation set wins; otherwise derive one from donations
    async fn resolve_split(
        &self,
        event_id: u64,
        totals: &[(u64, U256)],
        persist: bool,
    ) -> AppResult<Vec<Split>> {
        let allocations = self.store.allocations_for_event(event_id).await?;
        if let Some(splits) = manual_splits(&allocations) {
            return Ok(splits);
        }

        let splits = proportional_split(event_id, totals)?;
        if !persist {
            return Ok(splits);
        }

        let update = AllocationUpdate {
            event_id,
            splits: splits.clone(),
            source: AllocationSource::Proportional,
            approved_by: PROPORTIONAL_APPROVER.to_string(),
            tx_hash: None,
        };
        if self.store.replace_proportional_allocations(&update).await? {
            info!(
                "📊 Derived proportional split for event {} across {} org(s)",
                event_id,
                splits.len()
            );
            return Ok(splits);
        }

        // A manual set was committed after the read above
        let allocations = self.store.allocations_for_event(event_id).await?;
        match manual_splits(&allocations) {
            Some(splits) => {
                warn!(
                    "Event {} received a manual allocation while deriving a split, using it",
                    event_id
                );
                Ok(splits)
            }
            None => Err(AppError::Internal(format!(
                "allocation set for event {} changed while deriving a split",
                event_id
            ))),
        }
    }

    async fn recipient(&self, org_id: u64) -> AppResult<Recipient> {
        Ok(match self.store.organization(org_id).await? {
            Some(org) => Recipient {
                currency: currency_for_country(&org.country).to_string(),
                name: org.name,
                allowlisted: org.allowlisted,
            },
            None => {
                warn!("Organization {} not registered, paying out in {}", org_id, DEFAULT_CURRENCY);
                Recipient {
                    name: recipient_ref(org_id),
                    currency: DEFAULT_CURRENCY.to_string(),
                    allowlisted: true,
                }
            }
        })
    }

    /// Reserve, call the off-ramp, then finalize the row either way
    async fn settle_share(
        &self,
        event_id: u64,
        share: PlannedShare,
        recipient: Recipient,
        result: &mut PayoutExecResult,
    ) -> AppResult<()> {
        let reserved = self
            .store
            .reserve_payout(&NewPayout {
                event_id,
                org_id: share.org_id,
                amount_wei: share.amount_wei,
                fiat_currency: recipient.currency.clone(),
            })
            .await?;

        info!(
            "💸 Payout {} reserved: {} wei → org {} ({})",
            reserved.id, share.amount_wei, share.org_id, recipient.currency
        );

        let outcome = self
            .offramp_call(self.offramp.execute(
                share.amount_wei,
                &recipient.currency,
                &recipient_ref(share.org_id),
            ))
            .await
            .and_then(|settlement| {
                if settlement.success {
                    Ok(settlement)
                } else {
                    Err(OfframpError::Rejected("settlement reported unsuccessful".to_string()).into())
                }
            });

        match outcome {
            Ok(settlement) => {
                let fiat_amount = settlement.fiat_amount.to_string();
                self.store
                    .complete_payout(
                        reserved.id,
                        &PayoutSettlement {
                            fiat_currency: settlement.fiat_currency.clone(),
                            fiat_amount: fiat_amount.clone(),
                            offramp_ref: settlement.reference_hash.clone(),
                        },
                    )
                    .await?;

                info!(
                    "✓ Payout {} completed: {} {} ({})",
                    reserved.id, fiat_amount, settlement.fiat_currency, settlement.reference_hash
                );

                result.payouts.push(PayoutLine {
                    payout_id: reserved.id,
                    org_id: share.org_id,
                    org_name: recipient.name,
                    amount_wei: share.amount_wei,
                    fiat_amount,
                    fiat_currency: settlement.fiat_currency,
                    reference_hash: settlement.reference_hash,
                });
            }
            Err(err) => {
                let reason = err.to_string();
                self.store.fail_payout(reserved.id, &reason).await?;

                error!(
                    "❌ Payout {} to org {} failed: {}",
                    reserved.id, share.org_id, reason
                );

                result.failures.push(ShareFailure {
                    payout_id: reserved.id,
                    org_id: share.org_id,
                    org_name: recipient.name,
                    amount_wei: share.amount_wei,
                    reason,
                });
            }
        }

        Ok(())
    }

    async fn offramp_call<T>(
        &self,
        call: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        match tokio::time::timeout(self.offramp_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Offramp(OfframpError::Timeout {
                secs: self.offramp_timeout.as_secs(),
            })),
        }
    }
}

fn manual_splits(allocations: &[AllocationRecord]) -> Option<Vec<Split>> {
    allocations
        .first()
        .is_some_and(|a| a.source == AllocationSource::Manual)
        .then(|| {
            allocations
                .iter()
                .map(|a| Split {
                    org_id: a.org_id,
                    split_bps: a.split_bps,
                })
                .collect()
        })
}

/// Reference handed to the off-ramp for an organization
pub fn recipient_ref(org_id: u64) -> String {
    format!("org_{}", org_id)
}
