//! Ethereum staker CLI
//!
//! Creates a stake intent and funds it with a transaction signed by the
//! MPC nodes of the deployment.

use anyhow::{bail, Context, Result};
use clap::Parser;
use eth_staker::{
    explorer_tx_url, ClientIdentity, DeploymentConfig, JsonRpcClient, StakeOrchestrator,
    StakeOutcome, StakeRequest, StakingClient,
};
use ethers_core::types::Address;
use ethers_core::utils::format_ether;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tsm_core::{Curve, FileKeyStore, KeyManager, SignatureAggregator};

/// Ethereum staker
#[derive(Parser, Debug)]
#[command(name = "eth-staker")]
#[command(about = "Stake ETH from a threshold-signed address")]
#[command(version)]
struct Args {
    /// API key of the chain RPC
    #[arg(long, env = "BLOCKDAEMON_API_KEY", hide_env_values = true)]
    api_key: String,

    /// API key of the staking API
    #[arg(long, env = "BLOCKDAEMON_STAKE_API_KEY", hide_env_values = true)]
    stake_api_key: String,

    /// Network name, e.g. holesky or mainnet
    #[arg(long, env = "ETHEREUM_NETWORK", default_value = "holesky")]
    network: String,

    /// Address receiving withdrawals and execution rewards
    #[arg(long, env = "ETHEREUM_WITHDRAWAL_ADDRESS")]
    withdrawal_address: String,

    /// Deployment configuration file
    #[arg(long, env = "DEPLOYMENT_CONFIG", default_value = "deployment.json")]
    deployment: PathBuf,

    /// PEM client certificate for mTLS participants
    #[arg(long, env = "CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// PEM client key for mTLS participants
    #[arg(long, env = "CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Amount to stake in Gwei
    #[arg(long, default_value = "32000000000")]
    amount_gwei: u64,

    /// Reuse the idempotency key of an earlier attempt
    #[arg(long)]
    idempotency_key: Option<String>,

    /// Wait for the transaction to be mined
    #[arg(long)]
    confirm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let withdrawal_address: Address = args
        .withdrawal_address
        .trim()
        .parse()
        .with_context(|| format!("Invalid withdrawal address {:?}", args.withdrawal_address))?;

    let config = DeploymentConfig::load(&args.deployment)?;
    let identity = if config.requires_client_identity() {
        match (&args.client_cert, &args.client_key) {
            (Some(cert), Some(key)) => Some(ClientIdentity::load(cert, key)?),
            _ => bail!("mTLS participants require CLIENT_CERT and CLIENT_KEY"),
        }
    } else {
        None
    };

    let participants = config.participant_set(identity.as_ref())?;
    info!(
        participants = participants.len(),
        threshold = config.threshold,
        network = %args.network,
        "Loaded deployment"
    );

    let keys = KeyManager::new(participants.clone(), FileKeyStore::new(&config.key_file))
        .with_timeout(config.signing_timeout());
    let master = keys
        .get_or_create_master_key(config.threshold, Curve::Secp256k1)
        .await?;
    let derived = keys
        .derive_public_key(&master, &config.derivation_path()?)
        .await?;

    println!("Master key id: {}", master.id);
    println!("Staking address ({}): {}", derived.path, derived.address_hex());

    let rpc = Arc::new(JsonRpcClient::new(
        &config.service_url,
        &args.network,
        &args.api_key,
    ));
    let staking = Arc::new(StakingClient::new(
        &config.service_url,
        &args.network,
        &args.stake_api_key,
    ));
    let aggregator =
        SignatureAggregator::new(participants.clone()).with_timeout(config.signing_timeout());
    let orchestrator = StakeOrchestrator::new(
        staking,
        rpc,
        aggregator,
        derived,
        participants.player_ids(),
    );

    let idempotency_key = args
        .idempotency_key
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    println!("Idempotency key: {idempotency_key}");

    let request = StakeRequest {
        withdrawal_address,
        fee_recipient: withdrawal_address,
        amount_gwei: args.amount_gwei,
        idempotency_key,
    };

    match orchestrator.stake(&request).await? {
        StakeOutcome::InsufficientFunds {
            address,
            balance,
            required,
        } => {
            println!(
                "Balance of {address:?} is {} ETH but the deposit needs {} ETH.",
                format_ether(balance),
                format_ether(required)
            );
            println!("Fund the address and run again with the same --idempotency-key.");
        }
        StakeOutcome::Broadcast {
            tx_hash,
            stake_intent_id,
        } => {
            println!("Stake intent: {stake_intent_id}");
            println!("Transaction: {tx_hash:?}");
            println!("{}", explorer_tx_url(&args.network, &tx_hash));

            if args.confirm {
                let receipt = orchestrator
                    .await_confirmation(tx_hash, Duration::from_secs(12), 50)
                    .await?;
                println!(
                    "Confirmed in block {}",
                    receipt
                        .block_number
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "unknown".into())
                );
            }
        }
    }

    Ok(())
}
