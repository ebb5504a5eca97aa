use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::indexer::{ContractAddresses, IndexerConfig, DEFAULT_BLOCK_CHUNK};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OfframpBackend {
    Mock,
    Http,
}

/// Process configuration, read from the environment (after `.env`)
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: Option<String>,
    pub store_backend: StoreBackend,

    pub rpc_url: String,
    pub donation_vault_address: String,
    pub allocation_registry_address: String,
    pub payout_receipt_address: String,
    pub block_chunk: u64,
    pub start_block: u64,
    pub ledger_timeout_secs: u64,
    /// 0 disables the built-in schedule
    pub indexer_poll_secs: u64,

    pub offramp_backend: OfframpBackend,
    pub offramp_base_url: Option<String>,
    pub offramp_api_key: Option<String>,
    pub offramp_timeout_secs: u64,
    pub mock_offramp_latency_ms: u64,

    pub cron_api_key: Option<String>,
    pub rate_limit_per_minute: u32,
}

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(config::Environment::default())
    }

    fn load(env: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("store_backend", "postgres")?
            .set_default("rpc_url", "https://coston2-api.flare.network/ext/C/rpc")?
            .set_default("donation_vault_address", ZERO_ADDRESS)?
            .set_default("allocation_registry_address", ZERO_ADDRESS)?
            .set_default("payout_receipt_address", ZERO_ADDRESS)?
            .set_default("block_chunk", DEFAULT_BLOCK_CHUNK)?
            .set_default("start_block", 0)?
            .set_default("ledger_timeout_secs", 30)?
            .set_default("indexer_poll_secs", 0)?
            .set_default("offramp_backend", "mock")?
            .set_default("offramp_timeout_secs", 30)?
            .set_default("mock_offramp_latency_ms", 500)?
            .set_default("rate_limit_per_minute", 120)?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn contracts(&self) -> AppResult<ContractAddresses> {
        Ok(ContractAddresses {
            donation_vault: parse_address("DONATION_VAULT_ADDRESS", &self.donation_vault_address)?,
            allocation_registry: parse_address(
                "ALLOCATION_REGISTRY_ADDRESS",
                &self.allocation_registry_address,
            )?,
            payout_receipt: parse_address("PAYOUT_RECEIPT_ADDRESS", &self.payout_receipt_address)?,
        })
    }

    pub fn indexer_config(&self) -> AppResult<IndexerConfig> {
        Ok(IndexerConfig {
            contracts: self.contracts()?,
            block_chunk: self.block_chunk.max(1),
            start_block: self.start_block,
            ledger_timeout: self.ledger_timeout(),
        })
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_timeout_secs)
    }

    pub fn offramp_timeout(&self) -> Duration {
        Duration::from_secs(self.offramp_timeout_secs)
    }
}

fn parse_address(name: &str, raw: &str) -> AppResult<Address> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Address::ZERO);
    }
    Address::from_str(raw).map_err(|e| AppError::Config(format!("{} is not an address: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default().source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(env(&[])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert_eq!(config.offramp_backend, OfframpBackend::Mock);
        assert_eq!(config.block_chunk, 500);
        assert_eq!(config.indexer_poll_secs, 0);
        assert!(config.cron_api_key.is_none());

        let contracts = config.contracts().unwrap();
        assert!(contracts.donation_vault.is_zero());
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::load(env(&[
            ("STORE_BACKEND", "memory"),
            ("BLOCK_CHUNK", "100"),
            ("DONATION_VAULT_ADDRESS", "0x00000000000000000000000000000000000000a1"),
            ("CRON_API_KEY", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.indexer_config().unwrap().block_chunk, 100);
        assert!(!config.contracts().unwrap().donation_vault.is_zero());
        assert_eq!(config.cron_api_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_bad_address_is_config_error() {
        let config = Config::load(env(&[("PAYOUT_RECEIPT_ADDRESS", "not-an-address")])).unwrap();
        assert!(matches!(config.contracts(), Err(AppError::Config(_))));
    }
}
