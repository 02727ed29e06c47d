//! # Valcore Node
//!
//! Entry point for the valcore validator node: consensus, gossip
//! transport, mempool and ledger storage behind one binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use valcore_config::Config;
use valcore_consensus::Validator;
use valcore_node::{Genesis, Node};
use valcore_types::{Address, KeyedSigner, Signer};

/// Valcore node and tools
#[derive(Parser, Debug)]
#[command(name = "valcore")]
#[command(version)]
#[command(about = "Valcore validator node - BFT consensus over gossip")]
struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format: text, json, or compact
    #[arg(long, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
    Compact,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the node
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "valcore.toml")]
        config: String,

        /// Genesis file path
        #[arg(short, long, default_value = "genesis.toml")]
        genesis: String,

        /// Path to the validator key file
        #[arg(short, long)]
        key: String,

        /// Data directory (overrides config file)
        #[arg(short, long)]
        data_dir: Option<String>,

        /// P2P listen address (overrides config)
        #[arg(long)]
        listen_addr: Option<String>,

        /// Boot nodes (comma-separated host:port, overrides config)
        #[arg(long)]
        boot_nodes: Option<String>,
    },

    /// Initialize config, genesis, and validator keys for a new chain
    Init {
        /// Output directory for chain files
        #[arg(short, long, default_value = ".")]
        output: String,

        /// Chain ID
        #[arg(long, default_value = "6000")]
        chain_id: u64,

        /// Network name
        #[arg(long, default_value = "valcore-devnet")]
        network_id: String,

        /// Number of initial validators
        #[arg(long, default_value = "4")]
        validators: u32,

        /// Initial balance for each validator account
        #[arg(long, default_value = "1000000000")]
        balance: u64,
    },
}

/// On-disk genesis specification: the validator set plus pre-funded
/// accounts. Every node of a chain must start from the same file.
#[derive(Debug, Serialize, Deserialize)]
struct GenesisSpec {
    #[serde(default)]
    validators: Vec<ValidatorSpec>,
    #[serde(default)]
    accounts: Vec<AccountSpec>,
}

// TOML integers are i64, so powers and balances are u64 on disk and
// widened to u128 in memory.
#[derive(Debug, Serialize, Deserialize)]
struct ValidatorSpec {
    address: String,
    public_key: String,
    voting_power: u64,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountSpec {
    address: String,
    balance: u64,
}

impl GenesisSpec {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read genesis file {}", path.display()))?;
        toml::from_str(&content).context("malformed genesis file")
    }

    fn validators(&self) -> Result<Vec<Validator>> {
        self.validators
            .iter()
            .map(|v| {
                Ok(Validator {
                    address: Address::from_hex(&v.address)
                        .with_context(|| format!("bad validator address {}", v.address))?,
                    voting_power: u128::from(v.voting_power),
                    public_key: hex::decode(&v.public_key)
                        .with_context(|| format!("bad public key for {}", v.address))?,
                    active: v.active,
                })
            })
            .collect()
    }

    fn genesis(&self) -> Result<Genesis> {
        let balances = self
            .accounts
            .iter()
            .map(|a| {
                Ok((
                    Address::from_hex(&a.address)
                        .with_context(|| format!("bad account address {}", a.address))?,
                    u128::from(a.balance),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Genesis { balances })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Commands::Start {
            config,
            genesis,
            key,
            data_dir,
            listen_addr,
            boot_nodes,
        } => handle_start(config, genesis, key, data_dir, listen_addr, boot_nodes).await,
        Commands::Init {
            output,
            chain_id,
            network_id,
            validators,
            balance,
        } => handle_init(output, chain_id, network_id, validators, balance),
    }
}

fn init_tracing(cli: &Cli) {
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,valcore=debug",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true))
                .with(env_filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(env_filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(fmt::layer().compact())
                .with(env_filter)
                .init();
        }
    }
}

async fn handle_start(
    config_path: String,
    genesis_path: String,
    key_path: String,
    data_dir: Option<String>,
    listen_addr: Option<String>,
    boot_nodes: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting valcore");

    let mut config = Config::load(Path::new(&config_path))?;
    if let Some(dir) = data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(addr) = listen_addr {
        config.network.listen_addr = addr;
    }
    if let Some(nodes) = boot_nodes {
        config.network.boot_nodes = nodes.split(',').map(|s| s.trim().to_string()).collect();
    }

    let seed = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read key file {key_path}"))?;
    let signer: Arc<dyn Signer> = Arc::new(KeyedSigner::from_seed(seed.trim().as_bytes()));
    info!(address = %signer.address(), "validator key loaded");

    let spec = GenesisSpec::load(Path::new(&genesis_path))?;
    let validators = spec.validators()?;
    if validators.is_empty() {
        bail!("genesis file declares no validators");
    }
    let genesis = spec.genesis()?;

    let node = Node::new(config, signer, validators, genesis)?;
    let handle = node.handle();

    let runner = tokio::spawn(node.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    handle.shutdown();

    match runner.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "node task panicked");
            Err(e.into())
        }
    }
}

/// Generates a devnet: one config, one genesis file, and one key file per
/// validator. All validators are pre-funded.
fn handle_init(
    output: String,
    chain_id: u64,
    network_id: String,
    validators: u32,
    balance: u64,
) -> Result<()> {
    if validators == 0 {
        bail!("at least one validator is required");
    }
    let out = PathBuf::from(&output);
    std::fs::create_dir_all(&out)
        .with_context(|| format!("failed to create output directory {output}"))?;

    let mut validator_specs = Vec::new();
    let mut account_specs = Vec::new();
    for i in 0..validators {
        let seed = format!("valcore-validator-{i}");
        let signer = KeyedSigner::from_seed(seed.as_bytes());
        let address = signer.address();

        let key_path = out.join(format!("node-{i}.key"));
        std::fs::write(&key_path, &seed)
            .with_context(|| format!("failed to write {}", key_path.display()))?;

        validator_specs.push(ValidatorSpec {
            address: address.to_hex(),
            public_key: hex::encode(signer.public_key()),
            voting_power: 100,
            active: true,
        });
        account_specs.push(AccountSpec {
            address: address.to_hex(),
            balance,
        });
        info!(index = i, %address, "validator key generated");
    }

    let spec = GenesisSpec {
        validators: validator_specs,
        accounts: account_specs,
    };
    let genesis_path = out.join("genesis.toml");
    std::fs::write(&genesis_path, toml::to_string_pretty(&spec)?)
        .with_context(|| format!("failed to write {}", genesis_path.display()))?;

    let mut config = Config::default();
    config.chain.chain_id = chain_id;
    config.chain.network_id = network_id;
    config.save(&out.join("valcore.toml"))?;

    info!(
        output = %out.display(),
        validators,
        "chain initialized; start each node with its own --key and --data-dir"
    );
    Ok(())
}
