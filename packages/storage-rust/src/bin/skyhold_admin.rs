//! Skyhold storage maintenance CLI.
//!
//! # Commands
//!
//! - `list-ids` - Print every stored player id
//! - `resolve-island` - Print the owner of an island
//! - `invalidate` - Drop cached lookup state for a player across the group
//! - `invalidate-island` - Drop cached lookup state for an island across the group

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use skyhold_core::{IslandId, PlayerId};
use skyhold_storage::{SkyholdConfig, StorageManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Maintenance tools for Skyhold player storage.
#[derive(Parser)]
#[command(name = "skyhold-admin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration document (`.json`, `.yml` or `.yaml`). Defaults apply when omitted.
    #[arg(global = true, short, long, env = "SKYHOLD_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(global = true, long)]
    json_logs: bool,

    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every stored player id
    ListIds,

    /// Print the player owning an island
    ResolveIsland {
        /// Island id
        island: IslandId,
    },

    /// Drop cached lookup state for a player
    Invalidate {
        /// Player id
        player: PlayerId,
    },

    /// Drop cached lookup state for an island
    InvalidateIsland {
        /// Island id
        island: IslandId,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SkyholdConfig> {
    let Some(path) = path else {
        return Ok(SkyholdConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"));
    if is_yaml {
        serde_yaml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    } else {
        serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(manager: &StorageManager, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::ListIds => {
            let ids = manager.enumerate_ids().await?;
            for id in &ids {
                println!("{id}");
            }
            info!(count = ids.len(), "listed stored players");
        }
        Commands::ResolveIsland { island } => match manager.resolve_island(island).await? {
            Some(owner) => println!("{owner}"),
            None => anyhow::bail!("no player owns island {island}"),
        },
        Commands::Invalidate { player } => {
            manager.invalidate(player).await?;
            info!(player = %player, "invalidated");
        }
        Commands::InvalidateIsland { island } => {
            manager.invalidate_island(island).await?;
            info!(island, "invalidated");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let mut config = load_config(cli.config.as_deref())?;
    // One-shot process: never start the batch flusher.
    config.manager.flush_interval_secs = 0;

    // A maintenance run is not a server node: no Started or Stopping notices.
    let manager = StorageManager::open(config).await?;
    if !manager.is_ready() {
        anyhow::bail!("{} backend is not ready", manager.backend().kind());
    }

    let result = run(&manager, cli.command).await;
    manager.shutdown().await?;
    result
}
