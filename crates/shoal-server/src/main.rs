//! shoald - a node in a sharded, replicated in-memory key/value cluster
//!
//! Keys are partitioned into buckets by a hash mask; each bucket has a
//! primary replica on one node and at most one backup on another.  Nodes
//! exchange load reports, rebalance buckets between themselves, and
//! promote backups when a primary drains away.

mod server;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shoal_core::ShoalConfig;

use crate::server::ShoalServer;

#[derive(Parser)]
#[command(name = "shoald")]
#[command(version = shoal_core::VERSION)]
#[command(about = "Sharded in-memory key/value cluster node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Bind address
    #[arg(long, env = "SHOAL_BIND_ADDRESS")]
    bind: Option<String>,

    /// Port number
    #[arg(short, long, env = "SHOAL_PORT")]
    port: Option<u16>,

    /// Address advertised to peers and clients (host:port)
    #[arg(long, env = "SHOAL_ADVERTISE_ADDR")]
    advertise: Option<String>,

    /// Peer node to connect to (repeatable); omit to start a new cluster
    #[arg(long = "peer", env = "SHOAL_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SHOAL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cluster node
    Server,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    // Load or create config
    let mut config = if let Some(config_path) = &cli.config {
        ShoalConfig::from_file(config_path)?
    } else {
        ShoalConfig::from_env()
    };

    // Override with CLI args
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(advertise) = cli.advertise {
        config.cluster.advertise_addr = Some(advertise);
    }
    if !cli.peers.is_empty() {
        config.cluster.peers = cli.peers;
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("shoald {}", shoal_core::VERSION);
        }
        Some(Commands::Server) | None => {
            info!(version = shoal_core::VERSION, "starting shoald");
            ShoalServer::new(config).run().await?;
        }
    }

    Ok(())
}
