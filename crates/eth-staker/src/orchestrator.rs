//! End-to-end staking flow

use crate::assembler::{TransactionAssembler, TxStage};
use crate::rpc::{ChainRpc, Receipt};
use crate::staking::{StakeIntentRequest, StakeSpec, StakingApi};
use crate::{Result, StakeError};
use ethers_core::types::{Address, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use tsm_core::{DerivedKey, PlayerId, SignatureAggregator};

/// One staking run
#[derive(Debug, Clone)]
pub struct StakeRequest {
    pub withdrawal_address: Address,
    pub fee_recipient: Address,
    pub amount_gwei: u64,
    /// Reused by every retry of the same logical request
    pub idempotency_key: String,
}

/// How a staking run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StakeOutcome {
    /// Transaction accepted by the node
    Broadcast {
        tx_hash: H256,
        stake_intent_id: String,
    },
    /// The derived address cannot cover the deposit; nothing was signed
    InsufficientFunds {
        address: Address,
        balance: U256,
        required: U256,
    },
}

/// Drives a stake from intent creation to broadcast
pub struct StakeOrchestrator {
    staking: Arc<dyn StakingApi>,
    rpc: Arc<dyn ChainRpc>,
    assembler: TransactionAssembler,
    aggregator: SignatureAggregator,
    key: DerivedKey,
    signers: Vec<PlayerId>,
}

impl StakeOrchestrator {
    pub fn new(
        staking: Arc<dyn StakingApi>,
        rpc: Arc<dyn ChainRpc>,
        aggregator: SignatureAggregator,
        key: DerivedKey,
        signers: Vec<PlayerId>,
    ) -> Self {
        Self {
            staking,
            assembler: TransactionAssembler::new(Arc::clone(&rpc)),
            rpc,
            aggregator,
            key,
            signers,
        }
    }

    /// Address that funds and signs the deposit
    pub fn address(&self) -> Address {
        Address::from(self.key.address)
    }

    #[instrument(skip(self, request), fields(address = %self.key.address_hex()))]
    pub async fn stake(&self, request: &StakeRequest) -> Result<StakeOutcome> {
        let intent_request = StakeIntentRequest {
            stakes: vec![StakeSpec {
                withdrawal_address: format!("{:?}", request.withdrawal_address),
                amount: request.amount_gwei.to_string(),
                fee_recipient: format!("{:?}", request.fee_recipient),
            }],
        };
        info!(
            stage = %TxStage::IntentRequested,
            amount_gwei = request.amount_gwei,
            idempotency_key = %request.idempotency_key,
            "Requesting stake intent"
        );
        let intent = self
            .staking
            .create_stake_intent(&intent_request, &request.idempotency_key)
            .await?;

        let required = intent.total_wei()?;
        let address = self.address();
        let balance = self.rpc.balance(address).await?;
        if balance < required {
            warn!(%balance, %required, "Insufficient funds for deposit");
            return Ok(StakeOutcome::InsufficientFunds {
                address,
                balance,
                required,
            });
        }

        let unsigned = self
            .assembler
            .build_unsigned(
                address,
                intent.contract_address()?,
                required,
                intent.call_data()?,
            )
            .await?;

        info!(
            stage = %TxStage::SigningInProgress,
            signers = ?self.signers,
            "Requesting threshold signature"
        );
        let signature = self
            .aggregator
            .sign(&self.key, &unsigned.digest, &self.signers)
            .await?;

        let signed = TransactionAssembler::attach_signature(&unsigned, &signature)?;
        info!(
            stage = %TxStage::Signed,
            raw = %hex::encode(&signed.raw),
            "Signed transaction"
        );

        let recovered = TransactionAssembler::recover_signer(&signed, &unsigned.digest)?;
        if recovered != address {
            return Err(StakeError::SignatureMismatch {
                expected: address,
                recovered,
            });
        }

        let tx_hash = self.rpc.send_raw_transaction(&signed.raw).await?;
        if tx_hash != signed.hash {
            warn!(node = ?tx_hash, local = ?signed.hash, "Node reported a different hash");
        }
        info!(stage = %TxStage::Broadcast, tx_hash = ?tx_hash, "Transaction broadcast");

        Ok(StakeOutcome::Broadcast {
            tx_hash,
            stake_intent_id: intent.stake_intent_id,
        })
    }

    /// Poll until the transaction is mined
    pub async fn await_confirmation(
        &self,
        tx_hash: H256,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Result<Receipt> {
        for attempt in 1..=max_attempts {
            if let Some(receipt) = self.rpc.transaction_receipt(tx_hash).await? {
                if receipt.succeeded() {
                    info!(
                        stage = %TxStage::Confirmed,
                        tx_hash = ?tx_hash,
                        block = ?receipt.block_number,
                        "Transaction confirmed"
                    );
                    return Ok(receipt);
                }
                warn!(stage = %TxStage::Rejected, tx_hash = ?tx_hash, "Transaction reverted");
                return Err(StakeError::Rejected(tx_hash));
            }
            if attempt < max_attempts {
                tokio::time::sleep(poll_interval).await;
            }
        }
        Err(StakeError::Timeout(format!("receipt of {tx_hash:?}")))
    }
}
