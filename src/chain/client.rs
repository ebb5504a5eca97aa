use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;

use crate::error::AppResult;

/// Log as returned by the node, not yet decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
}

/// eth_getLogs filter for one contract and one event signature, inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

/// Read-only view of the ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Latest block number the node will serve logs for
    async fn current_height(&self) -> AppResult<u64>;

    async fn get_logs(&self, filter: &LogFilter) -> AppResult<Vec<RawLog>>;
}
