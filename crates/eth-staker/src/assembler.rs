//! EIP-1559 transaction assembly
//!
//! The assembler gathers chain parameters, builds the unsigned deposit
//! transaction and computes its signing digest. Once the threshold
//! signature is back it attaches it and produces the raw EIP-2718 bytes.

use crate::rpc::{CallRequest, ChainRpc};
use crate::{Result, StakeError};
use ethers_core::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest, Signature,
    H256, U256,
};
use ethers_core::utils::keccak256;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use tsm_core::{Digest, FinalSignature};

/// Stage of a staking transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    IntentRequested,
    UnsignedBuilt,
    DigestComputed,
    SigningInProgress,
    Signed,
    Broadcast,
    Confirmed,
    Rejected,
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStage::IntentRequested => "intent-requested",
            TxStage::UnsignedBuilt => "unsigned-built",
            TxStage::DigestComputed => "digest-computed",
            TxStage::SigningInProgress => "signing",
            TxStage::Signed => "signed",
            TxStage::Broadcast => "broadcast",
            TxStage::Confirmed => "confirmed",
            TxStage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A transaction ready to be signed
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub tx: TypedTransaction,
    /// keccak-256 of the typed unsigned encoding
    pub digest: Digest,
    pub chain_id: u64,
}

impl UnsignedTransaction {
    /// Typed unsigned encoding, `0x02 || rlp(fields)`
    pub fn encoded(&self) -> Bytes {
        self.tx.rlp()
    }
}

/// A signed transaction ready to broadcast
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// EIP-2718 envelope
    pub raw: Bytes,
    /// keccak-256 of `raw`
    pub hash: H256,
    pub signature: Signature,
}

/// Builds unsigned transactions from chain state and attaches signatures
pub struct TransactionAssembler {
    rpc: Arc<dyn ChainRpc>,
}

impl TransactionAssembler {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self { rpc }
    }

    /// Build the EIP-1559 transaction sending `value` with `call_data`
    /// from `sender` to `recipient`.
    #[instrument(skip(self, call_data))]
    pub async fn build_unsigned(
        &self,
        sender: Address,
        recipient: Address,
        value: U256,
        call_data: Bytes,
    ) -> Result<UnsignedTransaction> {
        let (nonce, gas_price, priority_fee, chain_id) = tokio::try_join!(
            self.rpc.pending_nonce(sender),
            self.rpc.gas_price(),
            self.rpc.max_priority_fee(),
            self.rpc.chain_id(),
        )?;

        let gas = self
            .rpc
            .estimate_gas(&CallRequest {
                from: sender,
                to: recipient,
                value,
                data: call_data.clone(),
                gas_price,
            })
            .await?;

        let max_fee = gas_price.max(priority_fee);
        let request = Eip1559TransactionRequest::new()
            .from(sender)
            .to(recipient)
            .value(value)
            .data(call_data)
            .nonce(nonce)
            .gas(gas)
            .max_priority_fee_per_gas(priority_fee)
            .max_fee_per_gas(max_fee)
            .chain_id(chain_id);

        let tx = TypedTransaction::Eip1559(request);
        info!(
            stage = %TxStage::UnsignedBuilt,
            %nonce,
            %gas,
            max_fee_per_gas = %max_fee,
            max_priority_fee_per_gas = %priority_fee,
            %value,
            chain_id,
            "Crafted transaction"
        );

        let digest = tx.sighash().0;
        debug!(
            stage = %TxStage::DigestComputed,
            unsigned = %hex::encode(tx.rlp()),
            digest = %hex::encode(digest),
            "Unsigned transaction"
        );

        Ok(UnsignedTransaction {
            tx,
            digest,
            chain_id,
        })
    }

    /// Attach a threshold signature. Typed transactions carry the y-parity
    /// only, so recovery ids above 1 are rejected.
    pub fn attach_signature(
        unsigned: &UnsignedTransaction,
        signature: &FinalSignature,
    ) -> Result<SignedTransaction> {
        if signature.recovery_id > 1 {
            return Err(StakeError::Signing(tsm_core::Error::InvalidSignature));
        }

        let r = U256::from_big_endian(&signature.r);
        let s = U256::from_big_endian(&signature.s);
        if r.is_zero() || s.is_zero() {
            return Err(StakeError::Signing(tsm_core::Error::InvalidSignature));
        }

        let signature = Signature {
            r,
            s,
            v: u64::from(signature.recovery_id),
        };
        let raw = unsigned.tx.rlp_signed(&signature);
        let hash = H256(keccak256(&raw));

        Ok(SignedTransaction {
            raw,
            hash,
            signature,
        })
    }

    /// Address that signed `digest`
    pub fn recover_signer(signed: &SignedTransaction, digest: &Digest) -> Result<Address> {
        signed
            .signature
            .recover(H256(*digest))
            .map_err(|e| StakeError::Signing(tsm_core::Error::Crypto(e.to_string())))
    }
}
