//! Ethereum JSON-RPC access

use crate::{Result, StakeError};
use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, H256, U256, U64};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Call used for gas estimation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_price: U256,
}

/// The fields of a transaction receipt this crate reads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub status: Option<U64>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == Some(U64::one())
    }
}

/// Chain queries and submission needed by the staking flow
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn balance(&self, address: Address) -> Result<U256>;

    /// Nonce including pending transactions
    async fn pending_nonce(&self, address: Address) -> Result<U256>;

    async fn gas_price(&self) -> Result<U256>;

    async fn max_priority_fee(&self) -> Result<U256>;

    async fn chain_id(&self) -> Result<u64>;

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256>;

    /// Submit a signed transaction and return its hash
    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<H256>;

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 client over HTTPS
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    next_id: AtomicU64,
    timeout: Duration,
}

impl JsonRpcClient {
    /// Client for `{service_url}/ethereum/{network}/native`
    pub fn new(service_url: &str, network: &str, api_key: &str) -> Self {
        Self::with_url(
            &format!(
                "{}/ethereum/{network}/native",
                service_url.trim_end_matches('/')
            ),
            api_key,
        )
    }

    /// Client for an explicit endpoint URL
    pub fn with_url(url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            next_id: AtomicU64::new(1),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StakeError::Rpc(format!("{method}: HTTP {status}: {text}")));
        }

        let reply: RpcResponse = response.json().await?;
        if let Some(error) = reply.error {
            return Err(StakeError::Rpc(format!(
                "{method}: {} (code {})",
                error.message, error.code
            )));
        }

        debug!(method, id, "RPC call completed");
        let result = reply.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| StakeError::InvalidResponse(format!("{method}: {e}")))
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    async fn balance(&self, address: Address) -> Result<U256> {
        self.call("eth_getBalance", json!([address, "latest"])).await
    }

    async fn pending_nonce(&self, address: Address) -> Result<U256> {
        self.call("eth_getTransactionCount", json!([address, "pending"]))
            .await
    }

    async fn gas_price(&self) -> Result<U256> {
        self.call("eth_gasPrice", json!([])).await
    }

    async fn max_priority_fee(&self) -> Result<U256> {
        self.call("eth_maxPriorityFeePerGas", json!([])).await
    }

    async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.call("eth_chainId", json!([])).await?;
        Ok(id.as_u64())
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256> {
        self.call("eth_estimateGas", json!([call])).await
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<H256> {
        self.call("eth_sendRawTransaction", json!([raw])).await
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>> {
        self.call("eth_getTransactionReceipt", json!([hash])).await
    }
}
