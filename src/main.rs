//! Signing operator CLI
//!
//! Entry point for running an operator, creating its identity key, or asking a
//! running operator to fill its keyshare pool.

use clap::{Parser, Subcommand};
use frost_operator::types::{ErrorResponse, GenerateKeysRequest, GenerateKeysResponse};
use frost_operator::{
    create_router, logging, FederationConfig, HttpTransport, IdentityKeystore, MemoryStore,
    OperatorNode,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "frost-operator")]
#[command(about = "Signing operator for a FROST statechain federation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operator server
    Run {
        /// Path to the federation config file
        #[arg(short, long)]
        config: String,

        /// Identity key password (or set FROST_OPERATOR_KEY_PASSWORD env var)
        #[arg(short, long, env = "FROST_OPERATOR_KEY_PASSWORD")]
        password: String,

        /// Timeout for calls to other operators, in seconds
        #[arg(long, default_value = "30")]
        peer_timeout: u64,
    },

    /// Create and encrypt a new identity key
    GenerateIdentity {
        /// Output file
        #[arg(short, long, default_value = "config/identity.key.enc")]
        output: String,

        /// Identity key password
        #[arg(short, long, env = "FROST_OPERATOR_KEY_PASSWORD")]
        password: String,
    },

    /// Generate keys for a running operator's pool
    Dkg {
        /// Path to the federation config file
        #[arg(short, long)]
        config: String,

        /// Number of keys to generate
        #[arg(short = 'n', long)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            password,
            peer_timeout,
        } => {
            run_server(config, password, peer_timeout).await?;
        }
        Commands::GenerateIdentity { output, password } => {
            logging::init_logging(logging::LogLevel::Info, false)?;
            let public_key = IdentityKeystore::new(&output).generate(&password)?;
            println!("{}", hex::encode(public_key));
        }
        Commands::Dkg { config, count } => {
            run_dkg(config, count).await?;
        }
    }

    Ok(())
}

/// Load the config and identity key and build the node
fn build_node(
    config_path: &str,
    password: &str,
    peer_timeout: u64,
) -> Result<Arc<OperatorNode>, Box<dyn std::error::Error>> {
    let config = FederationConfig::from_file(config_path)?;
    logging::init_from_config(&config)?;

    let identity_key = IdentityKeystore::new(&config.identity_key_path).load(password)?;
    let transport = HttpTransport::new(Duration::from_secs(peer_timeout))?;
    let node = OperatorNode::new(
        Arc::new(config),
        identity_key,
        Arc::new(MemoryStore::new()),
        Arc::new(transport),
    )?;
    Ok(node)
}

/// Run the operator server
async fn run_server(
    config_path: String,
    password: String,
    peer_timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = build_node(&config_path, &password, peer_timeout)?;
    node.spawn_maintenance(Duration::from_secs(60));
    node.keyshares.request_replenish();

    let addr: SocketAddr = node.config.bind_address.parse()?;
    let app = create_router(node.clone());

    tracing::info!(
        index = node.config.index,
        network = ?node.config.network,
        "Listening on {}",
        addr
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Ask the running operator to generate keys for its pool
async fn run_dkg(config_path: String, count: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = FederationConfig::from_file(config_path)?;
    logging::init_from_config(&config)?;
    let operator = config.this_operator()?;

    tracing::info!(operator = %operator.identifier, count, "Requesting DKG");
    let response = reqwest::Client::new()
        .post(format!("{}/admin/dkg", operator.address))
        .json(&GenerateKeysRequest { count })
        .send()
        .await?;
    if !response.status().is_success() {
        let error: ErrorResponse = response.json().await?;
        return Err(format!("{}: {}", error.code, error.message).into());
    }

    let started: GenerateKeysResponse = response.json().await?;
    println!("DKG {} started for {} keys", started.request_id, started.key_count);
    Ok(())
}
