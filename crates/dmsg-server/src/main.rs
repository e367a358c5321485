//! dmsg relay server
//!
//! Accepts client connections and relays circuits between them.

mod config;

use clap::{Parser, Subcommand};
use dmsg::{SecretKey, Server};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use config::Config;

/// dmsg relay server
#[derive(Parser)]
#[command(name = "dmsg-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address (overrides the config file)
        #[arg(short, long)]
        listen: Option<String>,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a new relay key pair
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            listen,
            verbose,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            config.validate()?;

            let level = if verbose {
                "debug".to_string()
            } else {
                config.logging.level.to_lowercase()
            };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
                )
                .init();

            run_relay(&config).await?;
        }
        Commands::Keygen => generate_keypair(),
    }

    Ok(())
}

/// Serve on the configured address until Ctrl-C
async fn run_relay(config: &Config) -> anyhow::Result<()> {
    let secret = config.secret_key()?;
    if config.server.secret_key.is_none() {
        tracing::warn!("no secret_key configured, using an ephemeral relay key");
    }

    let server = Server::new(secret, config.server_config())?;
    let listener = TcpListener::bind(config.listen_addr()?).await?;

    println!("dmsg relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Public key: {}", server.public_key());
    println!("Listen: {}", listener.local_addr()?);
    println!("Max sessions: {}", config.server.max_sessions);
    println!("Press Ctrl+C to stop");

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.close().await;
    serving.await??;

    let metrics = server.metrics();
    tracing::info!(
        total_connections = metrics.total_connections,
        frames_forwarded = metrics.frames_forwarded,
        "relay stopped"
    );
    Ok(())
}

fn generate_keypair() {
    let secret = SecretKey::generate();
    println!("Public key: {}", secret.public_key());
    println!("Secret key: {}", secret.to_hex());
    println!("\nKeep the secret key private. Put it in [server] secret_key to reuse this identity.");
}
