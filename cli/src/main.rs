//! factoryindex CLI: run, validate, and inspect dynamic contract indexers.
//!
//! Usage:
//! ```bash
//! factoryindex run      --config indexer.yaml
//! factoryindex validate --config indexer.yaml
//! factoryindex status   --config indexer.yaml --chain base
//! factoryindex events   --config indexer.yaml --chain base --name SupplyLiquidity
//! factoryindex reset    --config indexer.yaml --chain base --yes
//! factoryindex info
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use factoryindex_core::config::{ChainConfig, IndexerConfig, DEFAULT_SQLITE_PATH};
use factoryindex_core::types::ContractRole;
use factoryindex_evm::{AbiRegistry, HttpRpcClient, IndexerBuilder, Supervisor};
use factoryindex_storage::Storage;

mod logging;

#[derive(Parser)]
#[command(
    name = "factoryindex",
    about = "Dynamic contract-discovery event indexer for EVM chains",
    long_about = "
FactoryIndex follows factory contracts, registers every contract they create,
and indexes the events of all of them with reorg-safe checkpoints.

ENVIRONMENT VARIABLES:
  <chain>_RPC_URL        RPC URL override for a chain (e.g. base_RPC_URL or BASE_RPC_URL)
  NODE_ENV               'production' selects Postgres when no database is configured
  INDEXER_ENV            Alias of NODE_ENV
  RAILWAY_ENVIRONMENT    Any value selects Postgres when no database is configured
  DATABASE_URL           Postgres connection string
  DATABASE_SCHEMA        Postgres schema (default: public)
  RUST_LOG               Overrides the configured log directives
",
    version
)]
struct Cli {
    /// Path to the indexer config file
    #[arg(short, long, global = true, env = "FACTORYINDEX_CONFIG", default_value = "indexer.yaml")]
    config: PathBuf,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index every configured chain (or only the given ones) until Ctrl-C
    Run {
        /// Restrict to these chains (repeatable)
        #[arg(long = "chain")]
        chains: Vec<String>,
    },

    /// Check the config and every ABI it references
    Validate,

    /// Show checkpoint, watched contracts, and stored event counts
    Status {
        /// Only this chain
        #[arg(long)]
        chain: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print stored events as JSON lines
    Events {
        #[arg(long)]
        chain: String,
        /// Only events with this name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete the checkpoint, watched addresses, and events of a chain
    Reset {
        #[arg(long)]
        chain: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Show defaults and supported backends
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Info = cli.command {
        cmd_info();
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    logging::init_tracing(&config.logging, cli.json_logs);

    match cli.command {
        Commands::Run { chains } => cmd_run(&config, &chains).await,
        Commands::Validate => cmd_validate(&config),
        Commands::Status { chain, json } => cmd_status(&config, chain.as_deref(), json).await,
        Commands::Events { chain, name, limit } => {
            cmd_events(&config, &chain, name.as_deref(), limit).await
        }
        Commands::Reset { chain, yes } => cmd_reset(&config, &chain, yes).await,
        Commands::Info => Ok(()),
    }
}

fn load_config(path: &Path) -> Result<IndexerConfig> {
    let mut config = IndexerConfig::load(path)
        .with_context(|| format!("cannot load config {}", path.display()))?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn connect_storage(config: &IndexerConfig) -> Result<Storage> {
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| anyhow!("no database configured"))?;
    factoryindex_storage::connect(database)
        .await
        .with_context(|| format!("cannot connect to {} storage", database.kind()))
}

fn selected_chains<'a>(config: &'a IndexerConfig, only: &'a [String]) -> Result<Vec<&'a str>> {
    if only.is_empty() {
        return Ok(config.chains.keys().map(String::as_str).collect());
    }
    only.iter()
        .map(|name| {
            config.chain(name)?;
            Ok(name.as_str())
        })
        .collect()
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn cmd_run(config: &IndexerConfig, only: &[String]) -> Result<()> {
    let chains = selected_chains(config, only)?;
    let abis = Arc::new(AbiRegistry::from_config(config)?);
    let storage = connect_storage(config).await?;

    let mut supervisor = Supervisor::new();
    for name in chains {
        let chain = config.chain(name)?;
        let client = HttpRpcClient::default_for(&chain.rpc_url)?;
        let pipeline = IndexerBuilder::from_config(config, name)?
            .decoder(abis.clone())
            .backend(&storage)
            .build(client)
            .await
            .with_context(|| format!("cannot start chain '{name}'"))?;
        supervisor.spawn(pipeline);
    }

    let reports = supervisor
        .join_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    let failed: Vec<_> = reports.iter().filter(|r| !r.is_ok()).collect();
    if !failed.is_empty() {
        let names: Vec<_> = failed.iter().map(|r| r.chain.as_str()).collect();
        bail!("{} of {} chain(s) failed: {}", failed.len(), reports.len(), names.join(", "));
    }
    Ok(())
}

fn cmd_validate(config: &IndexerConfig) -> Result<()> {
    let abis = AbiRegistry::from_config(config)?;
    println!("Config OK");
    println!("  ABIs loaded: {}", abis.len());
    if let Some(database) = &config.database {
        println!("  Database: {}", database.kind());
    }
    for (name, chain) in &config.chains {
        let statics = config.static_addresses(name)?;
        let rules = config.discovery_rules(name);
        println!(
            "  {name} (chain id {}): start block {}, {} static address(es), {} discovery rule(s)",
            chain.id,
            config.start_block(name),
            statics.len(),
            rules.len()
        );
        for rule in rules {
            println!(
                "    {}.{}({}) -> {} [{}]",
                rule.source_abi_id, rule.event_name, rule.parameter, rule.child_abi_id, rule.child_role
            );
        }
    }
    Ok(())
}

async fn cmd_status(config: &IndexerConfig, only: Option<&str>, json: bool) -> Result<()> {
    let only: Vec<String> = only.map(str::to_string).into_iter().collect();
    let chains = selected_chains(config, &only)?;
    let storage = connect_storage(config).await?;

    let mut rows = Vec::with_capacity(chains.len());
    for name in chains {
        let chain_id = config.chain(name)?.id;
        let checkpoint = storage.checkpoints.load(chain_id).await?;
        let watched = storage.registry.load_addresses(chain_id).await?;
        let events = storage.events.event_count(chain_id).await?;

        let by_role: serde_json::Map<String, serde_json::Value> = ContractRole::ALL
            .iter()
            .map(|role| {
                let count = watched.iter().filter(|w| w.role == *role).count();
                (role.to_string(), count.into())
            })
            .collect();
        let discovered = watched.iter().filter(|w| w.is_discovered()).count();

        rows.push(serde_json::json!({
            "chain": name,
            "chain_id": chain_id,
            "last_processed_block": checkpoint.as_ref().map(|v| v.cursor.last_processed_block),
            "last_processed_log_index": checkpoint.as_ref().map(|v| v.cursor.last_processed_log_index),
            "updated_at": checkpoint.as_ref().and_then(|v| {
                chrono::DateTime::from_timestamp(v.cursor.updated_at, 0).map(|t| t.to_rfc3339())
            }),
            "watched": by_role,
            "discovered": discovered,
            "events": events,
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Storage: {}", storage.kind());
    for row in rows {
        println!("{} (chain id {})", row["chain"].as_str().unwrap_or_default(), row["chain_id"]);
        match row["last_processed_block"].as_u64() {
            Some(block) => println!(
                "  Checkpoint: block {block}, log index {} (updated {})",
                row["last_processed_log_index"],
                row["updated_at"].as_str().unwrap_or("?")
            ),
            None => println!("  Checkpoint: none"),
        }
        println!("  Watched: {} ({} discovered)", row["watched"], row["discovered"]);
        println!("  Events stored: {}", row["events"]);
    }
    Ok(())
}

async fn cmd_events(
    config: &IndexerConfig,
    chain: &str,
    name: Option<&str>,
    limit: usize,
) -> Result<()> {
    let chain_id = config.chain(chain)?.id;
    let storage = connect_storage(config).await?;
    for event in storage.events.events(chain_id, name, limit).await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

async fn cmd_reset(config: &IndexerConfig, chain: &str, yes: bool) -> Result<()> {
    let chain_id = config.chain(chain)?.id;
    if !yes {
        bail!("refusing to delete all state of chain '{chain}' without --yes");
    }
    let storage = connect_storage(config).await?;
    storage.events.purge_chain(chain_id).await?;
    println!("Reset chain '{chain}' (chain id {chain_id}) in {} storage", storage.kind());
    Ok(())
}

fn cmd_info() {
    let defaults = ChainConfig::new(0, "");
    println!("FactoryIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default confirmation depth: {} blocks", defaults.confirmation_depth);
    println!("  Default batch size: {} blocks", defaults.batch_size);
    println!("  Default eth_getLogs range: {} blocks", defaults.max_log_range);
    println!("  Default poll interval: {} ms", defaults.poll_interval_ms);
    println!("  Default reorg window: {} blocks", defaults.reorg_window);
    println!("  Storage backends: memory, SQLite (default {DEFAULT_SQLITE_PATH}), Postgres");
    println!("  Postgres is selected by NODE_ENV=production (or INDEXER_ENV) or RAILWAY_ENVIRONMENT");
    println!("  Contract roles: factory, pool, router, position");
}
