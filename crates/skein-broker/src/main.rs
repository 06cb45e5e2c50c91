//! Skein broker server binary

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use skein_broker::{Broker, BrokerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein-broker")]
#[command(about = "Skein realtime messaging broker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,

        /// Override the TCP port
        #[arg(short, long)]
        port: Option<u16>,

        /// Namespace paths to register besides the root `/`
        #[arg(short, long = "namespace")]
        namespaces: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            namespaces,
        } => {
            let mut cfg = match config {
                Some(path) => BrokerConfig::load(&path)?,
                None => BrokerConfig::default(),
            };
            if let Some(host) = host {
                cfg.host = host;
            }
            if let Some(port) = port {
                cfg.port = port;
            }

            let broker = Broker::new(cfg);
            for path in &namespaces {
                broker.namespace(path)?;
            }
            broker.run().await
        }
    }
}
