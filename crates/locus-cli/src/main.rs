//! Interactive Locus client.
//!
//! Connects to a server, registers the device, and offers a small
//! command shell:
//!
//! ```text
//! set-location <lat> <lon>
//! show-location
//! set-metadata <key> <value>
//! show-metadata <key>
//! show-server
//! show-id
//! get-metadata <node_id_hex> <key>
//! search-clients <lat1> <lon1> <lat2> <lon2>
//! quit
//! ```

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;
use tracing_subscriber::EnvFilter;

use locus_client::Client;
use locus_common::{Address, GeoPoint, NodeId};

/// Interactive Locus client
#[derive(Parser, Debug)]
#[command(
    name = "locus",
    version,
    about = "Interactive client for the Locus directory",
    long_about = "Registers a device with a Locus cluster and drives it interactively:\n\
                  report locations, read and write metadata, and follow the device as\n\
                  it migrates between servers."
)]
struct Args {
    /// Address to listen on for incoming peer connections
    #[arg(short = 'l', long, default_value = "[::]:0")]
    listen: String,

    /// Initial server to connect to
    #[arg(short = 's', long, required = true)]
    server: String,

    /// Log debug output to stderr
    #[arg(short = 'd', long)]
    debug: bool,
}

const PROMPT: &str = "locus> ";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let listen: Address = args.listen.parse().context("invalid listen address")?;
    let server: Address = args
        .server
        .parse()
        .context("invalid server address")?;

    let client = Client::new(listen, server)
        .await
        .context("failed to initialize client")?;

    println!("Welcome to Locus.");
    println!("Available commands:");
    println!("  set-location <lat> <lon>");
    println!("  show-location");
    println!("  set-metadata <key> <value>");
    println!("  show-metadata <key>");
    println!("  show-server");
    println!("  show-id");
    println!("  get-metadata <node_id_hex> <key>");
    println!("  search-clients <lat1> <lon1> <lat2> <lon2>");
    println!("  quit");

    let mut editor: Editor<(), DefaultHistory> = Editor::new()?;
    loop {
        let line = tokio::task::block_in_place(|| editor.readline(PROMPT));
        match line {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                match execute(&client, &line).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => eprintln!("Failed: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        }
    }

    println!("Bye");
    Ok(())
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("locus_client=debug,locus_rpc=debug")
    } else {
        EnvFilter::new("locus_client=warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Runs one command. Returns true when the session should end.
async fn execute(client: &Client, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();

    match command {
        "set-location" => {
            let lat: f64 = words
                .next()
                .context("usage: set-location <lat> <lon>")?
                .parse()
                .context("latitude is not a number")?;
            let lon: f64 = words
                .next()
                .context("usage: set-location <lat> <lon>")?
                .parse()
                .context("longitude is not a number")?;
            client.set_location(GeoPoint::new(lat, lon)).await?;
            println!("OK");
        }
        "show-location" => match client.location() {
            Some(point) => println!("Current location: {point}"),
            None => println!("No location set"),
        },
        "set-metadata" => {
            let key = words.next().context("usage: set-metadata <key> <value>")?;
            let value = words.next().context("usage: set-metadata <key> <value>")?;
            client.set_metadata(key, value).await?;
            println!("OK");
        }
        "show-metadata" => {
            let key = words.next().context("usage: show-metadata <key>")?;
            match client.local_metadata(key) {
                Some(value) => println!("{key} = {value}"),
                None => println!("{key} is not set"),
            }
        }
        "show-server" => {
            println!("Current server: {}", client.current_server());
        }
        "show-id" => match client.node_id() {
            Some(id) => println!("Node id: {id}"),
            None => println!("Not registered yet"),
        },
        "search-clients" => {
            let mut corner = |what: &str| -> Result<f64> {
                words
                    .next()
                    .with_context(|| {
                        "usage: search-clients <lat1> <lon1> <lat2> <lon2>".to_string()
                    })?
                    .parse()
                    .with_context(|| format!("{what} is not a number"))
            };
            let lower = GeoPoint::new(corner("lat1")?, corner("lon1")?);
            let upper = GeoPoint::new(corner("lat2")?, corner("lon2")?);
            let ids = client.search(lower, upper).await?;
            if ids.is_empty() {
                println!("No clients found");
            } else {
                for id in ids {
                    println!("{id}");
                }
            }
        }
        "get-metadata" => {
            let id_hex = words
                .next()
                .context("usage: get-metadata <node_id_hex> <key>")?;
            let key = words
                .next()
                .context("usage: get-metadata <node_id_hex> <key>")?;
            let id = NodeId::from_hex(id_hex).context("invalid node id")?;
            let value = client.get_remote_metadata(id, key).await?;
            println!("{key} = {value}");
        }
        "quit" | "exit" => return Ok(true),
        other => bail!("unknown command {other:?}"),
    }
    Ok(false)
}
