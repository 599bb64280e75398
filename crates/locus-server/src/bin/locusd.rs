//! Locus server daemon.
//!
//! `locusd` runs one authority of a Locus cluster:
//! - binds the listening socket and serves the directory protocol
//! - registers with the configured peers and takes part in load
//!   balancing
//! - shuts down cleanly on SIGTERM/SIGINT
//!
//! # Usage
//!
//! ```bash
//! # a standalone server owning the whole curve
//! locusd -l '[::]:7777'
//!
//! # join an existing cluster
//! locusd -l '[::]:7778' -p other-host:7777
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use locus_server::{Server, ServerConfig};

/// Locus directory server
#[derive(Parser, Debug)]
#[command(
    name = "locusd",
    version,
    about = "Locus directory server",
    long_about = "Runs one server of a Locus cluster: a geographically partitioned\n\
                  directory tracking the live locations and metadata of mobile clients."
)]
struct Args {
    /// Address to listen on
    #[arg(short = 'l', long, default_value = "[::]:7777", env = "LOCUS_LISTEN")]
    listen: String,

    /// Peer to register with (repeatable)
    #[arg(short = 'p', long = "peer")]
    peers: Vec<String>,

    /// Log debug output to stderr
    #[arg(short = 'd', long)]
    debug: bool,

    /// Curve resolution (even, at most 104)
    #[arg(long, env = "LOCUS_RESOLUTION")]
    resolution: Option<u8>,

    /// Configuration file path
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let server = Server::start(&config)
        .await
        .context("failed to start server")?;
    info!("locusd running on {}", server.address());
    info!("press Ctrl+C to shut down");

    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    Ok(())
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("locus_server=debug,locus_rpc=debug,locus_common=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path).context("failed to load config file")?,
        None => ServerConfig::default(),
    };

    config.listen = args.listen.clone();
    if !args.peers.is_empty() {
        config.peers = args.peers.clone();
    }
    if let Some(resolution) = args.resolution {
        config.resolution = resolution;
    }
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
