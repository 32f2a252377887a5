use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

pub mod allocate;
pub mod config;
pub mod inspect;
pub mod simulate;
pub mod verify;
pub mod version;

use config::TensorageConfig;

#[derive(Parser)]
#[command(name = "tensorage")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Proof-of-storage subnet participant", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate pair shards for every peer in a directory snapshot
    Allocate {
        /// Path to the config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the peer directory JSON snapshot
        #[arg(long)]
        directory: PathBuf,

        /// Wallet name (overrides config)
        #[arg(long)]
        wallet: Option<String>,

        /// Hotkey name (overrides config)
        #[arg(long)]
        hotkey: Option<String>,

        /// Own SS58 peer id (overrides config)
        #[arg(long)]
        peer_id: Option<String>,

        /// Database root (overrides config)
        #[arg(long)]
        db_root: Option<PathBuf>,

        /// Allocate hash-only shards as a validator
        #[arg(long)]
        validator: bool,

        /// Delete the role directory and regenerate from scratch
        #[arg(long)]
        restart: bool,

        /// Do not wait for confirmation before generating
        #[arg(long)]
        no_prompt: bool,
    },

    /// Check that every row of a shard database hashes to its stored hash
    Verify {
        /// Path to the shard database
        #[arg(long)]
        db_path: PathBuf,
    },

    /// Print size, tables and schema of a shard database
    Inspect {
        /// Path to the shard database
        #[arg(long)]
        db_path: PathBuf,
    },

    /// Run an in-process fleet and auditor for a few steps
    Simulate {
        /// Number of simulated provers
        #[arg(long, default_value_t = 3)]
        provers: usize,

        /// Validation steps to run
        #[arg(long, default_value_t = 5)]
        steps: usize,

        /// Chunk size in bytes (small by default to keep the run fast)
        #[arg(long, default_value_t = 4096)]
        chunk_size: usize,

        /// Optional file to round-trip through the sharder
        #[arg(long)]
        file: Option<PathBuf>,

        /// Keep state under this root instead of a scratch directory
        #[arg(long)]
        db_root: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve the operator config from a file plus command-line overrides.
fn resolve_config(
    config_path: Option<PathBuf>,
    wallet: Option<String>,
    hotkey: Option<String>,
    peer_id: Option<String>,
    db_root: Option<PathBuf>,
) -> Result<TensorageConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => TensorageConfig::load(&path)?,
        None => {
            let (Some(wallet), Some(hotkey), Some(peer_id)) =
                (wallet.clone(), hotkey.clone(), peer_id.clone())
            else {
                return Err(
                    "either --config or all of --wallet, --hotkey and --peer-id are required"
                        .into(),
                );
            };
            TensorageConfig::new(wallet, hotkey, peer_id)
        }
    };

    if let Some(wallet) = wallet {
        config.node.wallet = wallet;
    }
    if let Some(hotkey) = hotkey {
        config.node.hotkey = hotkey;
    }
    if let Some(peer_id) = peer_id {
        config.node.peer_id = peer_id;
    }
    if let Some(db_root) = db_root {
        config.node.db_root = db_root;
    }
    Ok(config)
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    match cli.command {
        Commands::Allocate {
            config,
            directory,
            wallet,
            hotkey,
            peer_id,
            db_root,
            validator,
            restart,
            no_prompt,
        } => {
            let config = resolve_config(config, wallet, hotkey, peer_id, db_root)?;
            allocate::execute(config, directory, validator, restart, no_prompt).await
        }
        Commands::Verify { db_path } => verify::execute(db_path).await,
        Commands::Inspect { db_path } => inspect::execute(db_path).await,
        Commands::Simulate {
            provers,
            steps,
            chunk_size,
            file,
            db_root,
        } => simulate::execute(provers, steps, chunk_size, file, db_root).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
