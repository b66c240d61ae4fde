//! Operator entry point.
//!
//! Loads configuration, wires the file store, chain RPC client and channel
//! client into an [`Operator`], then runs until Ctrl-C. Exit code 0 on a
//! clean shutdown, 1 on any unhandled error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};

use revpool_operator::{
    BlockTimestampCache, FsStore, HttpChannel, JsonRpcChainClient, Operator, OperatorConfig,
    WatcherSettings,
};

#[derive(Debug, Parser)]
#[command(name = "revpool-operator", about = "Community revenue pool operator")]
struct Cli {
    /// Path to the operator TOML config.
    #[arg(long, default_value = "operator.toml")]
    config: String,

    /// Wipe persisted state and resync from the contract's genesis.
    #[arg(long)]
    reset: bool,

    /// Log only warnings and errors.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match OperatorConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", cli.config);
            return ExitCode::FAILURE;
        }
    };
    config.reset |= cli.reset;
    config.quiet |= cli.quiet;

    let level = if config.quiet { Level::WARN } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(config).await {
        Ok(()) => {
            info!("operator stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("operator failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    let admin_fee = config.admin_fee_scaled().context("admin fee")?;

    info!("════════════════════════════════════════════════════════");
    info!("  revpool operator");
    info!("════════════════════════════════════════════════════════");
    info!("community:  {}", config.community_address);
    info!("token:      {}", config.token_address);
    info!("chain:      {} ({})", config.chain_url, config.chain_network);
    info!("channel:    {}", config.channel_url);
    info!("store:      {}", config.store_dir);
    info!("freeze:     {}s (bootstrap; contract value is authoritative)", config.block_freeze_seconds);
    info!(
        "signer:     {}",
        if config.operator_key.is_some() { "configured" } else { "none (read-only)" }
    );
    info!("reset:      {}", config.reset);
    info!("════════════════════════════════════════════════════════");

    let store = Arc::new(
        FsStore::open(&config.store_dir)
            .await
            .context("open store")?,
    );
    if config.reset {
        store.wipe().await.context("wipe store")?;
    }

    let mut timestamps = BlockTimestampCache::open(&config.store_dir).await;
    if config.chain_network == "mainnet" {
        // Historic mainnet timestamps shipped alongside the binary; absence
        // just means a slower first sync.
        timestamps
            .preload(format!("{}/mainnet-timestamps.json", config.store_dir))
            .await;
    }

    let chain = Arc::new(
        JsonRpcChainClient::new(
            config.chain_url.clone(),
            config.token_address,
            config.community_address,
        )
        .context("chain client")?,
    );
    let channel =
        HttpChannel::new(config.channel_url.clone(), config.community_address).context("channel client")?;

    let mut settings = WatcherSettings::new(config.token_address, config.community_address);
    settings.admin_fee = admin_fee;
    settings.chain_network = config.chain_network.clone();
    settings.reset = config.reset;

    let operator = Operator::spawn(settings, store, chain, &channel, timestamps)
        .await
        .context("start watcher")?;

    info!("operator running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested");

    operator.shutdown().await.context("shutdown")?;
    Ok(())
}
