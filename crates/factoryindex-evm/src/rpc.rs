//! Minimal EVM JSON-RPC client.
//!
//! Only the calls ingestion needs: `eth_blockNumber`, `eth_getBlockByNumber`,
//! `eth_getLogs`, and `eth_getTransactionReceipt`. Retries live one layer up in
//! [`ChainLogSource`](crate::fetcher::ChainLogSource); this client only
//! classifies failures as transient or not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U128, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use factoryindex_core::error::IndexerError;
use factoryindex_core::types::{BlockSummary, ChainId, RawLog, TransactionReceipt};

// ─── Wire types ───────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcError {
    /// Node-side errors worth retrying (rate limits, overloaded or lagging nodes).
    pub fn is_transient(&self) -> bool {
        matches!(self.code, -32005 | -32603 | 429)
            || self.message.contains("header not found")
            || self.message.contains("rate limit")
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result value or convert the error.
    pub fn into_result(self) -> Result<Value, IndexerError> {
        match self.error {
            Some(err) if err.is_transient() => Err(IndexerError::transient(format!(
                "JSON-RPC error {}: {}",
                err.code, err.message
            ))),
            Some(err) => Err(IndexerError::Rpc(format!(
                "JSON-RPC error {}: {}",
                err.code, err.message
            ))),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<U64>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Convert into a [`RawLog`] stamped with `chain_id`.
    ///
    /// Pending logs (no block number, hash, or index) are rejected.
    pub fn into_raw(self, chain_id: ChainId) -> Result<RawLog, IndexerError> {
        let (Some(block_number), Some(block_hash), Some(log_index)) =
            (self.block_number, self.block_hash, self.log_index)
        else {
            return Err(IndexerError::Rpc(format!(
                "log from {} is missing its block position",
                self.address
            )));
        };
        Ok(RawLog {
            chain_id,
            block_number: block_number.to::<u64>(),
            block_hash,
            tx_hash: self.transaction_hash,
            log_index: log_index.to::<u64>(),
            address: self.address,
            topics: self.topics,
            data: self.data,
        })
    }
}

/// A block header as returned by `eth_getBlockByNumber`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
}

impl From<RpcBlock> for BlockSummary {
    fn from(b: RpcBlock) -> Self {
        BlockSummary {
            number: b.number.to::<u64>(),
            hash: b.hash,
            parent_hash: b.parent_hash,
            timestamp: b.timestamp.to::<u64>(),
        }
    }
}

/// A receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub block_number: U64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub status: Option<U64>,
    pub gas_used: U64,
    #[serde(default)]
    pub effective_gas_price: Option<U128>,
}

impl From<RpcReceipt> for TransactionReceipt {
    fn from(r: RpcReceipt) -> Self {
        TransactionReceipt {
            transaction_hash: r.transaction_hash,
            block_hash: r.block_hash,
            block_number: r.block_number.to::<u64>(),
            from: r.from,
            to: r.to,
            contract_address: r.contract_address,
            // Pre-Byzantium receipts have no status; a transaction that emitted logs succeeded
            status: r.status.map_or(true, |s| s.to::<u64>() == 1),
            gas_used: r.gas_used.to::<u64>(),
            effective_gas_price: r.effective_gas_price.map(|p| p.to::<u128>()),
        }
    }
}

// ─── Client trait ─────────────────────────────────────────────────────────────

/// Trait for fetching EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, IndexerError>;

    /// Header of block `number`, `None` if the node does not have it yet.
    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;

    /// Logs in `[from, to]` emitted by any of `addresses`.
    async fn logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<RpcLog>, IndexerError>;

    /// Receipt of `tx_hash`, `None` if the node does not have it yet.
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<RpcReceipt>, IndexerError>;
}

// ─── HTTP client ──────────────────────────────────────────────────────────────

/// HTTP JSON-RPC client backed by `reqwest`.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a new client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with a 30 s request timeout.
    pub fn default_for(url: impl Into<String>) -> Result<Self, IndexerError> {
        Self::new(url, Duration::from_secs(30))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, IndexerError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| IndexerError::transient(format!("{method}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let reason = format!("{method}: HTTP {}: {body}", status.as_u16());
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                IndexerError::transient(reason)
            } else {
                IndexerError::Rpc(reason)
            });
        }

        let value = resp
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| IndexerError::transient(format!("{method}: malformed response: {e}")))?
            .into_result()?;
        serde_json::from_value(value)
            .map_err(|e| IndexerError::Rpc(format!("{method}: unexpected result: {e}")))
    }
}

#[async_trait]
impl EvmRpcClient for HttpRpcClient {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        let n: U64 = self.call("eth_blockNumber", vec![]).await?;
        Ok(n.to::<u64>())
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        let block: Option<RpcBlock> = self
            .call("eth_getBlockByNumber", vec![json!(format!("{number:#x}")), json!(false)])
            .await?;
        Ok(block.map(BlockSummary::from))
    }

    async fn logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<RpcLog>, IndexerError> {
        let filter = json!({
            "fromBlock": format!("{from:#x}"),
            "toBlock": format!("{to:#x}"),
            "address": addresses,
        });
        self.call("eth_getLogs", vec![filter]).await
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<RpcReceipt>, IndexerError> {
        self.call("eth_getTransactionReceipt", vec![json!(tx_hash)]).await
    }
}
