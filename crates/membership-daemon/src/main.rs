//! membership-daemon: standalone gossip membership agent.
//!
//! Joins a cluster through its seeds and logs every peer event until
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use membership_core::config::{
    BIND, HEARTBEAT_ENDPOINTS, HEARTBEAT_GENERATION, HEARTBEAT_INTERVAL, WIRE_CODEC,
};
use membership_core::control::AGENT_EXIT;
use membership_core::Config;
use membership_daemon::Node;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "membership-daemon")]
#[command(about = "Gossip cluster membership agent")]
struct Args {
    /// Properties file (key = value per line)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for peer links
    #[arg(short, long, env = "MEMBERSHIP_BIND")]
    bind: Option<String>,

    /// Comma-separated seed endpoints (host:port)
    #[arg(long, env = "MEMBERSHIP_SEEDS")]
    seeds: Option<String>,

    /// Gossip interval in milliseconds
    #[arg(long)]
    interval: Option<u64>,

    /// Generation (defaults to the current Unix time in seconds)
    #[arg(long)]
    generation: Option<u32>,

    /// Wire codec: bincode or json
    #[arg(long)]
    codec: Option<String>,

    /// Local header as key=value (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {:?}", value))
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let overrides = [
        (BIND, args.bind.clone()),
        (HEARTBEAT_ENDPOINTS, args.seeds.clone()),
        (HEARTBEAT_INTERVAL, args.interval.map(|v| v.to_string())),
        (HEARTBEAT_GENERATION, args.generation.map(|v| v.to_string())),
        (WIRE_CODEC, args.codec.clone()),
    ];
    for (key, value) in overrides {
        if let Some(value) = value {
            config
                .set(key, &value)
                .with_context(|| format!("Invalid value for {}", key))?;
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "membership_daemon=debug,membership_core=debug"
    } else {
        "membership_daemon=info,membership_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&args)?;
    info!("Starting membership-daemon");
    info!("Bind address: {}", config.bind);
    info!("Seeds: {:?}", config.seeds);
    info!("Generation: {}", config.generation);

    let mut node = Node::start(config).await?;
    info!("Agent address: {}", node.address());

    for (key, value) in &args.headers {
        node.put_header(key, value)?;
    }

    info!("Running. Press Ctrl+C to stop.");
    let mut interrupted = false;
    loop {
        tokio::select! {
            message = node.recv() => {
                let Some(message) = message else {
                    warn!("Agent stopped unexpectedly");
                    break;
                };
                let name = message.name().unwrap_or("?");
                if name == AGENT_EXIT {
                    break;
                }
                let args: Vec<&str> = (0..message.args().len())
                    .filter_map(|i| message.arg_str(i))
                    .collect();
                info!("{} {}", name, args.join(" "));
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Shutdown signal received");
                interrupted = true;
                node.shutdown();
            }
        }
    }

    node.join().await?;
    info!("Shut down");
    Ok(())
}
