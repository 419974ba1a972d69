//! Staking-intent API client

use crate::{Result, StakeError};
use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Wei per Gwei
pub const WEI_PER_GWEI: u64 = 1_000_000_000;

/// One requested validator stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeSpec {
    pub withdrawal_address: String,
    /// Amount in Gwei, decimal
    pub amount: String,
    pub fee_recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeIntentRequest {
    pub stakes: Vec<StakeSpec>,
}

/// One stake the service set up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeEntry {
    pub stake_id: String,
    /// Amount in Gwei, decimal
    pub amount: String,
    pub validator_public_key: String,
    pub withdrawal_credentials: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumStakeIntent {
    pub stakes: Vec<StakeEntry>,
    pub contract_address: String,
    /// Hex call data of the batch deposit
    pub unsigned_transaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeIntentResponse {
    pub stake_intent_id: String,
    pub ethereum: EthereumStakeIntent,
}

impl StakeIntentResponse {
    /// Sum of all stake amounts, converted to Wei
    pub fn total_wei(&self) -> Result<U256> {
        self.ethereum
            .stakes
            .iter()
            .try_fold(U256::zero(), |total, stake| {
                let gwei = U256::from_dec_str(stake.amount.trim()).map_err(|e| {
                    StakeError::InvalidResponse(format!(
                        "Stake {} amount {:?}: {e}",
                        stake.stake_id, stake.amount
                    ))
                })?;
                let wei = gwei.checked_mul(U256::from(WEI_PER_GWEI)).ok_or_else(|| {
                    StakeError::Overflow(format!("Stake {} amount", stake.stake_id))
                })?;
                total
                    .checked_add(wei)
                    .ok_or_else(|| StakeError::Overflow("Total stake amount".into()))
            })
    }

    /// Deposit contract the transaction is sent to
    pub fn contract_address(&self) -> Result<Address> {
        self.ethereum.contract_address.trim().parse().map_err(|e| {
            StakeError::InvalidResponse(format!(
                "Contract address {:?}: {e}",
                self.ethereum.contract_address
            ))
        })
    }

    /// Call data of the deposit transaction
    pub fn call_data(&self) -> Result<Bytes> {
        let data = self.ethereum.unsigned_transaction.trim();
        hex::decode(data.trim_start_matches("0x"))
            .map(Bytes::from)
            .map_err(|e| StakeError::InvalidResponse(format!("Unsigned transaction data: {e}")))
    }
}

/// Creates stake intents
#[async_trait]
pub trait StakingApi: Send + Sync {
    /// Create a stake intent. Retries of the same logical request must
    /// reuse `idempotency_key`.
    async fn create_stake_intent(
        &self,
        request: &StakeIntentRequest,
        idempotency_key: &str,
    ) -> Result<StakeIntentResponse>;
}

/// HTTP client of the staking-intent API
pub struct StakingClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

impl StakingClient {
    /// Client for `{service_url}/boss/v1/ethereum/{network}/stake-intents`
    pub fn new(service_url: &str, network: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/boss/v1/ethereum/{network}/stake-intents",
                service_url.trim_end_matches('/')
            ),
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StakingApi for StakingClient {
    #[instrument(skip(self, request), fields(stakes = request.stakes.len()))]
    async fn create_stake_intent(
        &self,
        request: &StakeIntentRequest,
        idempotency_key: &str,
    ) -> Result<StakeIntentResponse> {
        debug!(request = %serde_json::to_string(request)?, "Stake API request");

        let response = self
            .client
            .post(&self.url)
            .header("X-API-Key", &self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .header("Accept", "application/json")
            .json(request)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StakeError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let intent: StakeIntentResponse = response.json().await?;
        info!(
            stake_intent_id = %intent.stake_intent_id,
            stakes = intent.ethereum.stakes.len(),
            contract = %intent.ethereum.contract_address,
            "Stake intent created"
        );
        Ok(intent)
    }
}
