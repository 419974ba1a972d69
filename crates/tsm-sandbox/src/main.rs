//! TSM Sandbox
//!
//! Runs a local cluster of loopback signing nodes for development.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{info, Level};
use tsm_sandbox::{Cluster, ClusterConfig};

/// Sandbox CLI arguments
#[derive(Parser, Debug)]
#[command(name = "tsm-sandbox")]
#[command(about = "Local cluster of threshold signing nodes for development")]
#[command(version)]
struct Args {
    /// Number of players
    #[arg(short, long, default_value = "3")]
    players: usize,

    /// Port of player 0; the others follow consecutively
    #[arg(short, long, default_value = "8500")]
    base_port: u16,

    /// API key every node expects
    #[arg(long, env = "SANDBOX_API_KEY", default_value = "sandbox")]
    api_key: String,

    /// Host to listen on
    #[arg(long, default_value = "127.0.0.1")]
    listen_host: String,

    /// Seconds a node waits for its peers during a round
    #[arg(long, default_value = "30")]
    round_timeout: u64,

    /// Seconds relay messages of a session are kept
    #[arg(long, default_value = "600")]
    ttl: u64,
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

    info!(
        players = args.players,
        base_port = args.base_port,
        host = %args.listen_host,
        "Starting sandbox cluster"
    );

    let config = ClusterConfig {
        players: args.players,
        host: args.listen_host,
        base_port: args.base_port,
        api_key: args.api_key.clone(),
        relay_timeout: Duration::from_secs(args.round_timeout),
        session_ttl: Duration::from_secs(args.ttl),
    };
    let cluster = Cluster::start(&config).await?;

    println!("Sandbox participants (for the deployment configuration):");
    println!(
        "{}",
        serde_json::to_string_pretty(&cluster.deployment_participants(&args.api_key))?
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    drop(cluster);

    Ok(())
}
