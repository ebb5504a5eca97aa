// Indexer Scheduler - ticks ChainIndexer::run on a fixed interval
//
// Retry policy lives here, not in the indexer: a failed tick is logged and
// the next tick resumes from the persisted cursor.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use super::ChainIndexer;
use crate::error::ErrorKind;

pub struct IndexerScheduler {
    indexer: Arc<ChainIndexer>,
    poll_interval: Duration,
}

impl IndexerScheduler {
    pub fn new(indexer: Arc<ChainIndexer>, poll_interval: Duration) -> Self {
        Self {
            indexer,
            poll_interval,
        }
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let indexer = self.indexer.clone();
        let poll_interval = self.poll_interval;

        info!("⏰ Indexer scheduled every {}s", poll_interval.as_secs());

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                Self::tick(&indexer).await;
            }
        })
    }

    async fn tick(indexer: &ChainIndexer) {
        match indexer.run().await {
            Ok(result) if result.indexed > 0 => {
                info!("✓ Indexed {} log(s) up to block {}", result.indexed, result.to_block)
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::DataIntegrity => {
                error!("❌ Indexer halted on bad data, operator action needed: {}", e)
            }
            Err(e) => warn!("⚠️ Indexer run failed, retrying next tick: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{donation_log, MockLedgerClient};
    use crate::indexer::{ContractAddresses, IndexerConfig};
    use crate::store::{InMemorySettlementStore, SettlementStore};
    use alloy_primitives::{address, U256};

    #[tokio::test]
    async fn test_scheduler_keeps_indexing_after_failure() {
        let vault = address!("00000000000000000000000000000000000000a1");
        let store = Arc::new(InMemorySettlementStore::new());
        let ledger = Arc::new(MockLedgerClient::new(20));
        ledger.push(donation_log(
            vault,
            15,
            1,
            address!("00000000000000000000000000000000000000d0"),
            1,
            1,
            U256::from(10u64),
        ));
        ledger.fail_at_block(Some(15));

        let indexer = Arc::new(ChainIndexer::new(
            store.clone(),
            ledger.clone(),
            IndexerConfig {
                contracts: ContractAddresses {
                    donation_vault: vault,
                    ..ContractAddresses::default()
                },
                ..IndexerConfig::default()
            },
        ));

        IndexerScheduler::tick(&indexer).await;
        assert_eq!(store.cursor().await.unwrap().last_processed_block, 0);

        ledger.fail_at_block(None);
        let handle = IndexerScheduler::new(indexer, Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(store.cursor().await.unwrap().last_processed_block, 20);
        assert_eq!(store.donations_for_event(1).await.unwrap().len(), 1);
    }
}
