//! rbit-dht - join the BitTorrent Mainline DHT from the command line.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rbit_dht::dht::{Dht, DhtConfig, InfoHash};

#[derive(Parser)]
#[command(name = "rbit-dht")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Local UDP address
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    bind: SocketAddr,

    /// Extra bootstrap node, tried before the public routers (repeatable)
    #[arg(long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the DHT and stay online until interrupted
    Run,

    /// Look up peers for an info hash
    Peers {
        /// Info hash as 40 hex characters
        info_hash: String,
    },

    /// Ping a single node
    Ping {
        addr: SocketAddr,
    },
}

fn parse_info_hash(hex_str: &str) -> Result<InfoHash> {
    let bytes = hex::decode(hex_str).context("info hash is not valid hex")?;
    match InfoHash::try_from(bytes.as_slice()) {
        Ok(hash) => Ok(hash),
        Err(_) => bail!("info hash must be 20 bytes, got {}", bytes.len()),
    }
}

fn print_stats(dht: &Dht) {
    let routing = dht.routing_table();
    let nodes = routing.all_nodes();
    let good = nodes.iter().filter(|n| n.is_good()).count();
    let bad = nodes.iter().filter(|n| n.is_bad()).count();

    println!("Node ID: {}", dht.local_id());
    println!("Routing table: {} nodes", nodes.len());
    println!("  good:         {}", good);
    println!("  questionable: {}", nodes.len() - good - bad);
    println!("  bad:          {}", bad);
}

async fn join(dht: &Dht) -> Result<()> {
    dht.start().context("Failed to start DHT")?;
    dht.bootstrap().await.context("Failed to bootstrap")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).init();

    let dht = Dht::bind(DhtConfig::new(cli.bind))
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;
    for addr in cli.bootstrap {
        dht.add_bootstrap_node_address(addr);
    }

    match cli.command {
        Commands::Run => {
            join(&dht).await?;
            print_stats(&dht);
            info!("DHT node running, press Ctrl-C to stop");

            signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            print_stats(&dht);
        }
        Commands::Peers { info_hash } => {
            let info_hash = parse_info_hash(&info_hash)?;
            join(&dht).await?;

            let outcome = dht.get_peers(info_hash).await?;
            if outcome.peers.is_empty() {
                warn!("No peers found");
            }
            for peer in &outcome.peers {
                println!("{}", peer);
            }
            println!(
                "{} peers, {} tokens from {} nodes",
                outcome.peers.len(),
                outcome.tokens.len(),
                outcome.closest.len()
            );
        }
        Commands::Ping { addr } => {
            dht.start().context("Failed to start DHT")?;
            let id = dht.ping(addr).await.with_context(|| format!("{} did not answer", addr))?;
            println!("{} is {}", addr, id);
        }
    }

    dht.stop().await;
    Ok(())
}
