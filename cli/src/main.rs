mod config;
mod node;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::NodeConfig;
use node::Node;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agorad")]
#[command(about = "Agora peer-to-peer trading node", version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted (default)
    Run {
        /// Overrides `node.data_dir`
        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,

        /// Overrides `node.listen`
        #[arg(long, value_name = "HOST:PORT")]
        listen: Option<String>,

        /// Extra seed peer, may be repeated
        #[arg(long = "seed", value_name = "HOST:PORT")]
        seeds: Vec<String>,

        /// Overrides `node.log_level`; RUST_LOG takes precedence
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Write a new node key and print its public key
    Keygen {
        /// Key file to write, defaults to the configured one
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,

        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path),
        None => Ok(NodeConfig::default()),
    }
}

fn keygen(config: &NodeConfig, out: Option<PathBuf>, force: bool) -> Result<()> {
    let path = out.unwrap_or_else(|| config.key_file());
    if path.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to replace it", path.display());
    }
    let keypair = agora_crypto::KeyPair::generate();
    node::write_key(&path, &keypair)?;
    println!("{}", keypair.public_key_hex());
    Ok(())
}

async fn run(config: NodeConfig) -> Result<()> {
    info!(data_dir = %config.node.data_dir.display(), "Starting agora node");

    let keypair = node::load_or_create_key(&config.key_file())?;
    info!(pubkey = %keypair.public_key_hex(), "Node key loaded");

    let node = Node::start(&config, keypair).await?;
    let connected = node.dial_seeds(&config).await?;
    info!(seeds = config.node.seeds.len(), connected, "Bootstrap finished");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Command::Run {
        data_dir: None,
        listen: None,
        seeds: Vec::new(),
        log_level: None,
    }) {
        Command::Keygen { out, force } => keygen(&config, out, force),
        Command::Run {
            data_dir,
            listen,
            seeds,
            log_level,
        } => {
            if let Some(data_dir) = data_dir {
                config.node.data_dir = data_dir;
            }
            if let Some(listen) = listen {
                config.node.listen = listen;
            }
            config.node.seeds.extend(seeds);
            if let Some(level) = log_level {
                config.node.log_level = level;
            }
            init_tracing(&config.node.log_level);
            run(config).await
        }
    }
}
