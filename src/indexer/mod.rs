// Chain Indexer - mirrors contract events into the Settlement Store
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::chain::{ChainEvent, EventKind, LedgerClient, LogFilter, RawLog};
use crate::error::{AppError, AppResult, LedgerError};
use crate::store::models::ChunkBatch;
use crate::store::SettlementStore;

pub use scheduler::IndexerScheduler;

/// Blocks per eth_getLogs request
pub const DEFAULT_BLOCK_CHUNK: u64 = 500;

/// Deployed contract addresses; a zero address disables that stream
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractAddresses {
    pub donation_vault: Address,
    pub allocation_registry: Address,
    pub payout_receipt: Address,
}

impl ContractAddresses {
    pub fn for_kind(&self, kind: EventKind) -> Address {
        match kind {
            EventKind::DonationReceived => self.donation_vault,
            EventKind::AllocationSet => self.allocation_registry,
            EventKind::PayoutRecorded => self.payout_receipt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub contracts: ContractAddresses,
    pub block_chunk: u64,
    /// First block worth scanning (contract deployment)
    pub start_block: u64,
    pub ledger_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            contracts: ContractAddresses::default(),
            block_chunk: DEFAULT_BLOCK_CHUNK,
            start_block: 0,
            ledger_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerRunResult {
    pub indexed: usize,
    pub to_block: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerStatus {
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
    pub chain_height: Option<u64>,
    pub lag_blocks: Option<u64>,
}

/// Chain Indexer
///
/// Replays `(cursor, height]` in fixed-size chunks. Each chunk is fully
/// fetched and decoded before anything is written, then applied to the
/// store together with the cursor advance in one atomic write. A failure
/// leaves the cursor at the last committed chunk.
pub struct ChainIndexer {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<dyn LedgerClient>,
    config: IndexerConfig,
    run_lock: tokio::sync::Mutex<()>,
}

impl ChainIndexer {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<dyn LedgerClient>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[instrument(skip(self), fields(ledger = self.ledger.name()))]
    pub async fn run(&self) -> AppResult<IndexerRunResult> {
        // Overlapping runs would only refetch the same ranges
        let _guard = self.run_lock.lock().await;

        let cursor = self.store.cursor().await?;
        let height = self
            .ledger_call("eth_blockNumber", self.ledger.current_height())
            .await?;

        let mut from = cursor
            .last_processed_block
            .saturating_add(1)
            .max(self.config.start_block);

        if from > height {
            info!("✓ Indexer up to date at block {}", height);
            return Ok(IndexerRunResult {
                indexed: 0,
                to_block: height,
            });
        }

        info!("🔄 Indexing blocks {}..={}", from, height);

        let chunk = self.config.block_chunk.max(1);
        let mut indexed = 0;

        while from <= height {
            let to = from.saturating_add(chunk - 1).min(height);

            let batch = self.fetch_chunk(from, to).await?;
            let outcome = self.store.apply_chunk(&batch).await?;
            if outcome.stale {
                let cursor = self.store.cursor().await?;
                warn!(
                    "Blocks {}..={} already committed by another indexer (cursor {}), stopping",
                    from, to, cursor.last_processed_block
                );
                return Ok(IndexerRunResult {
                    indexed,
                    to_block: cursor.last_processed_block,
                });
            }
            indexed += batch.log_count();

            info!(
                "📊 Blocks {}..={} committed: {} donation(s), {} allocation set(s), {} receipt(s) ({} reconciled)",
                from,
                to,
                outcome.donations_inserted,
                outcome.allocation_sets_applied,
                outcome.payouts_inserted,
                outcome.payouts_reconciled
            );

            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }

        Ok(IndexerRunResult {
            indexed,
            to_block: height,
        })
    }

    pub async fn status(&self) -> AppResult<IndexerStatus> {
        let cursor = self.store.cursor().await?;
        let chain_height = match self
            .ledger_call("eth_blockNumber", self.ledger.current_height())
            .await
        {
            Ok(height) => Some(height),
            Err(e) => {
                warn!("Chain height unavailable: {}", e);
                None
            }
        };

        Ok(IndexerStatus {
            last_processed_block: cursor.last_processed_block,
            updated_at: cursor.updated_at,
            chain_height,
            lag_blocks: chain_height.map(|h| h.saturating_sub(cursor.last_processed_block)),
        })
    }

    /// Fetch all three streams in parallel and decode them into one batch
    async fn fetch_chunk(&self, from_block: u64, to_block: u64) -> AppResult<ChunkBatch> {
        let [donations, allocations, payouts] = EventKind::ALL;
        let (donation_logs, mut allocation_logs, mut payout_logs) = tokio::try_join!(
            self.fetch_logs(donations, from_block, to_block),
            self.fetch_logs(allocations, from_block, to_block),
            self.fetch_logs(payouts, from_block, to_block),
        )?;

        // Later allocation sets in the range must win
        allocation_logs.sort_by_key(|log| (log.block_number, log.log_index));
        payout_logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut batch = ChunkBatch {
            from_block,
            to_block,
            ..ChunkBatch::default()
        };

        for (kind, logs) in [
            (donations, donation_logs),
            (allocations, allocation_logs),
            (payouts, payout_logs),
        ] {
            for log in &logs {
                ChainEvent::decode(kind, log)?.push_into(&mut batch)?;
            }
        }

        Ok(batch)
    }

    async fn fetch_logs(
        &self,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> AppResult<Vec<RawLog>> {
        let address = self.config.contracts.for_kind(kind);
        if address.is_zero() {
            return Ok(Vec::new());
        }

        let filter = LogFilter {
            address,
            topic0: kind.signature_hash(),
            from_block,
            to_block,
        };
        self.ledger_call("eth_getLogs", self.ledger.get_logs(&filter))
            .await
    }

    async fn ledger_call<T>(
        &self,
        method: &'static str,
        call: impl std::future::Future<Output = AppResult<T>>,
    ) -> AppResult<T> {
        match tokio::time::timeout(self.config.ledger_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Ledger(LedgerError::Timeout {
                method,
                secs: self.config.ledger_timeout.as_secs(),
            })),
        }
    }
}
