//! Scripted off-ramp for engine tests

use std::collections::HashSet;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::mock::MockOfframpAdapter;
use super::traits::{OfframpAdapter, OfframpQuote, SettlementResult};
use crate::error::{AppResult, OfframpError};

/// Mock rates with per-recipient failure and hang injection
pub struct ScriptedOfframp {
    inner: MockOfframpAdapter,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    executed: Mutex<Vec<(String, U256)>>,
}

impl ScriptedOfframp {
    pub fn new() -> Self {
        Self {
            inner: MockOfframpAdapter::new(Duration::ZERO),
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_for(&self, recipient_ref: &str) {
        self.failing.lock().insert(recipient_ref.to_string());
    }

    pub fn hang_for(&self, recipient_ref: &str) {
        self.hanging.lock().insert(recipient_ref.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
        self.hanging.lock().clear();
    }

    /// Successful executions, in call order
    pub fn executed(&self) -> Vec<(String, U256)> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl OfframpAdapter for ScriptedOfframp {
    fn name(&self) -> &'static str {
        "ScriptedOfframp"
    }

    async fn get_quote(&self, amount_wei: U256, currency: &str) -> AppResult<OfframpQuote> {
        self.inner.get_quote(amount_wei, currency).await
    }

    async fn execute(
        &self,
        amount_wei: U256,
        currency: &str,
        recipient_ref: &str,
    ) -> AppResult<SettlementResult> {
        if self.hanging.lock().contains(recipient_ref) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.lock().contains(recipient_ref) {
            return Err(OfframpError::Unavailable(format!("rail down for {}", recipient_ref)).into());
        }
        let result = self.inner.execute(amount_wei, currency, recipient_ref).await?;
        self.executed
            .lock()
            .push((recipient_ref.to_string(), amount_wei));
        Ok(result)
    }
}
