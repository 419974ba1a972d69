//! # Ethereum staker
//!
//! Stakes ETH from an address whose key is held by a set of MPC nodes.
//!
//! A run creates a stake intent with the staking API, checks the derived
//! address can fund the deposit, builds an EIP-1559 transaction to the
//! deposit contract, has the nodes produce a threshold signature over its
//! digest and broadcasts the result.

pub mod assembler;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod rpc;
pub mod staking;

pub use assembler::{SignedTransaction, TransactionAssembler, TxStage, UnsignedTransaction};
pub use config::{ClientIdentity, DeploymentConfig, ParticipantAuth, ParticipantConfig};
pub use error::{Result, StakeError};
pub use orchestrator::{StakeOrchestrator, StakeOutcome, StakeRequest};
pub use rpc::{CallRequest, ChainRpc, JsonRpcClient, Receipt};
pub use staking::{StakeIntentRequest, StakeIntentResponse, StakeSpec, StakingApi, StakingClient};

use ethers_core::types::H256;

/// Block explorer link for a transaction
pub fn explorer_tx_url(network: &str, tx_hash: &H256) -> String {
    let host = match network {
        "mainnet" => "etherscan.io".to_string(),
        other => format!("{other}.etherscan.io"),
    };
    format!("https://{host}/tx/{tx_hash:?}")
}
