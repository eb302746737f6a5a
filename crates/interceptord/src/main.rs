//! interceptord: runs fault-injecting TCP relays.
//!
//! Loads a relay document, validates every bridge before opening any
//! socket, activates them all, then runs until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! interceptord run --config relays.toml
//! interceptord run --bridges '[{"interposing_host": "127.0.0.1", ...}]'
//! interceptord check --config relays.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use interceptor_core::RelayConfig;
use interceptor_relay::Bridge;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,interceptord=debug,interceptor=debug";

#[derive(Parser)]
#[command(name = "interceptord", about = "Fault-injecting TCP relay daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Activate every bridge and relay until interrupted.
    Run {
        #[command(flatten)]
        source: Source,
    },
    /// Validate a relay document and print the resolved bridges.
    Check {
        #[command(flatten)]
        source: Source,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// Relay document (TOML, or the legacy JSON list for `.json` files).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Inline legacy JSON bridge list.
    #[arg(long)]
    bridges: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { source } => run(&source).await,
        Command::Check { source } => check(&source),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load(source: &Source) -> anyhow::Result<RelayConfig> {
    match (&source.config, &source.bridges) {
        (Some(path), _) => RelayConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        (None, Some(json)) => {
            RelayConfig::from_bridges_json(json).context("failed to parse --bridges")
        }
        (None, None) => anyhow::bail!("one of --config or --bridges is required"),
    }
}

async fn run(source: &Source) -> anyhow::Result<()> {
    let config = load(source)?;
    let descriptors = config
        .descriptors()
        .context("invalid relay configuration")?;

    info!(bridges = descriptors.len(), "interceptor starting");

    let mut bridges = Vec::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        let bridge = Bridge::from_descriptor(descriptor, config.socket, config.relay);
        let local = bridge
            .activate()
            .await
            .with_context(|| format!("failed to activate bridge {}", descriptor.name))?;

        info!(
            bridge = %descriptor.name,
            %local,
            target = %descriptor.target,
            forward = descriptor.forward.name(),
            reverse = descriptor.reverse.name(),
            "bridge active"
        );
        bridges.push(bridge);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    for bridge in &bridges {
        let stats = bridge.stats();
        info!(
            bridge = %bridge.name(),
            phases = stats.phases_started,
            teardowns = stats.teardowns,
            connect_attempts = stats.connect_attempts,
            "bridge stopped"
        );
    }

    Ok(())
}

fn check(source: &Source) -> anyhow::Result<()> {
    let config = load(source)?;
    let descriptors = config
        .descriptors()
        .context("invalid relay configuration")?;

    for descriptor in &descriptors {
        println!(
            "{}: {} -> {} (forward: {}, reverse: {})",
            descriptor.name,
            descriptor.listen,
            descriptor.target,
            descriptor.forward.name(),
            descriptor.reverse.name(),
        );
    }
    println!();
    print!("{}", config.to_toml_string()?);

    Ok(())
}
