use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::client::{LedgerClient, LogFilter, RawLog};
use crate::error::{AppResult, LedgerError};

/// Ethereum JSON-RPC client (eth_blockNumber / eth_getLogs)
pub struct JsonRpcLedgerClient {
    client: Client,
    rpc_url: String,
    request_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<String>,
    log_index: Option<String>,
    transaction_hash: Option<B256>,
    #[serde(default)]
    removed: bool,
}

impl JsonRpcLedgerClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
            request_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> AppResult<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        debug!("→ {} (id {})", method, id);

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            ))
            .into());
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(err) = body.error {
            return Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            }
            .into());
        }

        body.result
            .ok_or_else(|| LedgerError::InvalidResponse(format!("{}: empty result", method)).into())
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    fn name(&self) -> &'static str {
        "json-rpc"
    }

    async fn current_height(&self) -> AppResult<u64> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&raw)?)
    }

    async fn get_logs(&self, filter: &LogFilter) -> AppResult<Vec<RawLog>> {
        let params = json!([{
            "address": filter.address,
            "topics": [filter.topic0],
            "fromBlock": format!("0x{:x}", filter.from_block),
            "toBlock": format!("0x{:x}", filter.to_block),
        }]);

        let logs: Vec<RpcLog> = self.call("eth_getLogs", params).await?;
        let mut out = Vec::with_capacity(logs.len());

        for log in logs {
            if log.removed {
                warn!("Skipping removed log from {:#x}", log.address);
                continue;
            }
            out.push(RawLog {
                address: log.address,
                topics: log.topics,
                data: log.data,
                block_number: required_quantity("blockNumber", log.block_number.as_deref())?,
                log_index: required_quantity("logIndex", log.log_index.as_deref())?,
                tx_hash: log.transaction_hash.ok_or_else(|| {
                    LedgerError::InvalidResponse("log without transactionHash".to_string())
                })?,
            });
        }

        Ok(out)
    }
}

fn required_quantity(field: &str, raw: Option<&str>) -> Result<u64, LedgerError> {
    let raw = raw.ok_or_else(|| LedgerError::InvalidResponse(format!("log without {}", field)))?;
    parse_quantity(raw)
}

/// Parse a hex-encoded JSON-RPC quantity ("0x1a")
pub fn parse_quantity(raw: &str) -> Result<u64, LedgerError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::InvalidResponse(format!("quantity without 0x: {}", raw)))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::InvalidResponse(format!("bad quantity {}: {}", raw, e)))
}
