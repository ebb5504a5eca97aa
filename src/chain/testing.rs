//! In-process ledger and log builders for tests

use alloy_primitives::{Address, Bytes, LogData, B256, U256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{LedgerClient, LogFilter, RawLog};
use super::events::{AllocationSet, DonationReceived, PayoutRecorded};
use crate::error::{AppResult, LedgerError};

pub struct MockLedgerClient {
    height: Mutex<u64>,
    logs: Mutex<Vec<RawLog>>,
    fail_at_block: Mutex<Option<u64>>,
    calls: Mutex<Vec<LogFilter>>,
}

impl MockLedgerClient {
    pub fn new(height: u64) -> Self {
        Self {
            height: Mutex::new(height),
            logs: Mutex::new(Vec::new()),
            fail_at_block: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, log: RawLog) {
        self.logs.lock().push(log);
    }

    pub fn set_height(&self, height: u64) {
        *self.height.lock() = height;
    }

    /// Any get_logs range covering `block` fails until cleared
    pub fn fail_at_block(&self, block: Option<u64>) {
        *self.fail_at_block.lock() = block;
    }

    pub fn calls(&self) -> Vec<LogFilter> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn current_height(&self) -> AppResult<u64> {
        Ok(*self.height.lock())
    }

    async fn get_logs(&self, filter: &LogFilter) -> AppResult<Vec<RawLog>> {
        self.calls.lock().push(*filter);

        if let Some(block) = *self.fail_at_block.lock() {
            if (filter.from_block..=filter.to_block).contains(&block) {
                return Err(LedgerError::Transport(format!("injected failure at {}", block)).into());
            }
        }

        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|log| {
                log.address == filter.address
                    && log.topics.first() == Some(&filter.topic0)
                    && (filter.from_block..=filter.to_block).contains(&log.block_number)
            })
            .cloned()
            .collect())
    }
}

pub fn tx_hash(seed: u64) -> B256 {
    B256::left_padding_from(&seed.to_be_bytes())
}

fn raw_log(address: Address, block_number: u64, seed: u64, data: LogData) -> RawLog {
    RawLog {
        address,
        topics: data.topics().to_vec(),
        data: Bytes::from(data.data.to_vec()),
        block_number,
        log_index: seed,
        tx_hash: tx_hash(seed),
    }
}

pub fn donation_log(
    address: Address,
    block_number: u64,
    seed: u64,
    donor: Address,
    event_id: u64,
    org_id: u64,
    amount: U256,
) -> RawLog {
    let event = DonationReceived {
        donor,
        eventId: U256::from(event_id),
        orgId: U256::from(org_id),
        amount,
    };
    raw_log(address, block_number, seed, event.encode_log_data())
}

pub fn allocation_log(
    address: Address,
    block_number: u64,
    seed: u64,
    event_id: u64,
    splits: &[(u64, u64)],
) -> RawLog {
    let event = AllocationSet {
        eventId: U256::from(event_id),
        orgIds: splits.iter().map(|(org, _)| U256::from(*org)).collect(),
        splitsBps: splits.iter().map(|(_, bps)| U256::from(*bps)).collect(),
    };
    raw_log(address, block_number, seed, event.encode_log_data())
}

#[allow(clippy::too_many_arguments)]
pub fn payout_log(
    address: Address,
    block_number: u64,
    seed: u64,
    event_id: u64,
    org_id: u64,
    amount: U256,
    fiat_currency: &str,
    fiat_amount: &str,
    offramp_ref: &str,
) -> RawLog {
    let event = PayoutRecorded {
        eventId: U256::from(event_id),
        orgId: U256::from(org_id),
        amount,
        fiatCurrency: fiat_currency.to_string(),
        fiatAmount: fiat_amount.to_string(),
        offrampRefHash: offramp_ref.to_string(),
    };
    raw_log(address, block_number, seed, event.encode_log_data())
}
