//! Indexer configuration: chains, contracts, database, and logging.
//!
//! Loaded from YAML. Environment overrides are applied once at startup via
//! [`IndexerConfig::apply_env`]; nothing reads the environment afterwards.
//!
//! ```yaml
//! chains:
//!   base:
//!     id: 8453
//!     rpc_url: https://mainnet.base.org
//! contracts:
//!   LendingPoolFactory:
//!     chain: base
//!     abi: abis/LendingPoolFactory.json
//!     role: factory
//!     addresses: ["0x42C5dFc5899160e9c4e2E139AfFe7472dDf4D86E"]
//!     start_block: 37140924
//!   LendingPool:
//!     chain: base
//!     abi: abis/LendingPool.json
//!     role: pool
//!     start_block: 37140924
//!     discovered_by:
//!       contract: LendingPoolFactory
//!       event: LendingPoolCreated
//!       parameter: lendingPool
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryRule;
use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::{AddressSource, ChainId, ContractRole, WatchedAddress};

/// Default embedded database location.
pub const DEFAULT_SQLITE_PATH: &str = ".factoryindex/index.db";

// ─── Top level ────────────────────────────────────────────────────────────────

/// Full indexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Chain name → chain settings.
    pub chains: BTreeMap<String, ChainConfig>,
    /// Contract name (also its ABI id) → contract settings.
    #[serde(default)]
    pub contracts: BTreeMap<String, ContractConfig>,
    /// Explicit database; when absent it is chosen from the environment.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LogConfig,
    /// Directory ABI paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl IndexerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, IndexerError> {
        serde_yaml::from_str(yaml).map_err(|e| IndexerError::Config(format!("invalid YAML: {e}")))
    }

    /// Read and parse a config file. ABI paths become relative to its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IndexerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    /// Apply environment overrides using `lookup` (usually `std::env::var(..).ok()`).
    ///
    /// - `<chain>_RPC_URL` (as written, or upper-cased) replaces a chain's RPC URL.
    /// - Without an explicit `database` section, the database is chosen by
    ///   [`DatabaseConfig::from_env`].
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), IndexerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, chain) in self.chains.iter_mut() {
            let exact = format!("{name}_RPC_URL");
            let upper = format!("{}_RPC_URL", name.to_ascii_uppercase().replace('-', "_"));
            if let Some(url) = lookup(&exact).or_else(|| lookup(&upper)) {
                tracing::debug!(chain = %name, "RPC URL overridden from environment");
                chain.rpc_url = url;
            }
        }
        if self.database.is_none() {
            self.database = Some(DatabaseConfig::from_env(&lookup)?);
        }
        Ok(())
    }

    /// Structural validation. ABI contents are checked when the ABIs are loaded.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.chains.is_empty() {
            return Err(IndexerError::config("no chains configured"));
        }
        for (name, chain) in &self.chains {
            if chain.rpc_url.trim().is_empty() {
                return Err(IndexerError::Config(format!("chain '{name}': rpc_url is empty")));
            }
            if chain.batch_size == 0 || chain.max_log_range == 0 {
                return Err(IndexerError::Config(format!(
                    "chain '{name}': batch_size and max_log_range must be positive"
                )));
            }
            if chain.reorg_window == 0 {
                return Err(IndexerError::Config(format!(
                    "chain '{name}': reorg_window must be positive"
                )));
            }
            if let (Some(start), Some(end)) = (chain.start_block, chain.to_block) {
                if end < start {
                    return Err(IndexerError::Config(format!(
                        "chain '{name}': to_block {end} is before start_block {start}"
                    )));
                }
            }
        }

        let mut seen: HashMap<(&str, Address), &str> = HashMap::new();
        for (name, contract) in &self.contracts {
            if !self.chains.contains_key(&contract.chain) {
                return Err(IndexerError::Config(format!(
                    "contract '{name}' references unknown chain '{}'",
                    contract.chain
                )));
            }
            if contract.role == ContractRole::Factory
                && contract.addresses.is_empty()
                && contract.discovered_by.is_none()
            {
                return Err(IndexerError::Config(format!(
                    "factory contract '{name}' has no addresses"
                )));
            }
            for address in &contract.addresses {
                if *address == Address::ZERO {
                    return Err(IndexerError::Config(format!(
                        "contract '{name}' lists the zero address"
                    )));
                }
                if let Some(other) = seen.insert((contract.chain.as_str(), *address), name) {
                    return Err(IndexerError::Config(format!(
                        "address {address} is listed under both '{other}' and '{name}'"
                    )));
                }
            }
            if let Some(source) = &contract.discovered_by {
                let Some(parent) = self.contracts.get(&source.contract) else {
                    return Err(IndexerError::Config(format!(
                        "contract '{name}' is discovered by unknown contract '{}'",
                        source.contract
                    )));
                };
                if source.contract == *name {
                    return Err(IndexerError::Config(format!(
                        "contract '{name}' cannot be discovered by itself"
                    )));
                }
                if parent.chain != contract.chain {
                    return Err(IndexerError::Config(format!(
                        "contract '{name}' is discovered by '{}' on a different chain",
                        source.contract
                    )));
                }
                if source.event.is_empty() || source.parameter.is_empty() {
                    return Err(IndexerError::Config(format!(
                        "contract '{name}': discovered_by needs an event and a parameter"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn chain(&self, name: &str) -> Result<&ChainConfig, IndexerError> {
        self.chains
            .get(name)
            .ok_or_else(|| IndexerError::Config(format!("unknown chain '{name}'")))
    }

    /// Contracts deployed on `chain`.
    pub fn contracts_on<'a>(
        &'a self,
        chain: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a ContractConfig)> + 'a {
        self.contracts.iter().filter(move |(_, c)| c.chain == chain)
    }

    /// First block to index on `chain`: its own `start_block`, else the
    /// lowest contract start block, else genesis.
    pub fn start_block(&self, chain: &str) -> u64 {
        self.chains
            .get(chain)
            .and_then(|c| c.start_block)
            .or_else(|| self.contracts_on(chain).map(|(_, c)| c.start_block).min())
            .unwrap_or(0)
    }

    /// Discovery rules for contracts on `chain`.
    pub fn discovery_rules(&self, chain: &str) -> Vec<DiscoveryRule> {
        self.contracts_on(chain)
            .filter_map(|(name, contract)| {
                contract.discovered_by.as_ref().map(|source| DiscoveryRule {
                    source_abi_id: source.contract.clone(),
                    event_name: source.event.clone(),
                    parameter: source.parameter.clone(),
                    child_role: contract.role,
                    child_abi_id: name.clone(),
                })
            })
            .collect()
    }

    /// ABI ids on `chain` whose events carry transaction receipts.
    pub fn receipt_abis(&self, chain: &str) -> BTreeSet<String> {
        self.contracts_on(chain)
            .filter(|(_, contract)| contract.include_transaction_receipts)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Statically configured addresses on `chain`, ready to seed a registry.
    pub fn static_addresses(&self, chain: &str) -> Result<Vec<WatchedAddress>, IndexerError> {
        let chain_id = self.chain(chain)?.id;
        Ok(self
            .contracts_on(chain)
            .flat_map(|(name, contract)| {
                contract.addresses.iter().map(move |address| WatchedAddress {
                    chain_id,
                    address: *address,
                    role: contract.role,
                    abi_id: name.clone(),
                    discovered_at_block: contract.start_block,
                    source: AddressSource::Static,
                })
            })
            .collect())
    }

    /// Absolute (or cwd-relative) path of a contract's ABI file.
    pub fn abi_path(&self, contract: &ContractConfig) -> PathBuf {
        if contract.abi.is_absolute() {
            contract.abi.clone()
        } else {
            self.base_dir.join(&contract.abi)
        }
    }
}

// ─── Chains ───────────────────────────────────────────────────────────────────

/// Per-chain ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: ChainId,
    pub rpc_url: String,
    /// Overrides the lowest contract start block.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Stop after this block (`None` = follow the chain forever).
    #[serde(default)]
    pub to_block: Option<u64>,
    /// Blocks behind head considered safe to index.
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Blocks fetched per pipeline batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Largest block span requested in a single `eth_getLogs` call.
    #[serde(default = "default_max_log_range")]
    pub max_log_range: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of recent headers kept for reorg detection.
    #[serde(default = "default_reorg_window")]
    pub reorg_window: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_confirmation_depth() -> u64 {
    12
}
fn default_batch_size() -> u64 {
    500
}
fn default_max_log_range() -> u64 {
    2_000
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_reorg_window() -> usize {
    128
}

impl ChainConfig {
    pub fn new(id: ChainId, rpc_url: impl Into<String>) -> Self {
        Self {
            id,
            rpc_url: rpc_url.into(),
            start_block: None,
            to_block: None,
            confirmation_depth: default_confirmation_depth(),
            batch_size: default_batch_size(),
            max_log_range: default_max_log_range(),
            poll_interval_ms: default_poll_interval_ms(),
            reorg_window: default_reorg_window(),
            retry: RetryConfig::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ─── Contracts ────────────────────────────────────────────────────────────────

/// One contract (or family of contracts sharing an ABI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub chain: String,
    /// ABI JSON file: a plain ABI array, or a build artifact with an `abi` field.
    pub abi: PathBuf,
    pub role: ContractRole,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub start_block: u64,
    /// Creation event that announces instances of this contract.
    #[serde(default)]
    pub discovered_by: Option<DiscoverySource>,
    /// Attach the transaction receipt to every event of this contract.
    #[serde(default)]
    pub include_transaction_receipts: bool,
}

/// The `discovered_by` section of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySource {
    /// Name of the emitting contract.
    pub contract: String,
    pub event: String,
    /// Address-typed event parameter holding the new contract.
    pub parameter: String,
}

// ─── Database ─────────────────────────────────────────────────────────────────

/// Where checkpoints, registry entries, and decoded events are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Postgres {
        connection_string: String,
        #[serde(default = "default_schema")]
        schema: String,
        #[serde(default)]
        pool: PoolConfig,
    },
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
    /// Nothing survives a restart.
    Memory,
}

/// Connection pool limits for Postgres.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
        }
    }
}

fn default_schema() -> String {
    "public".into()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from(DEFAULT_SQLITE_PATH)
}

impl DatabaseConfig {
    /// Choose a database from the environment.
    ///
    /// `NODE_ENV=production` (or its alias `INDEXER_ENV=production`) or any
    /// `RAILWAY_ENVIRONMENT` selects Postgres (`DATABASE_URL` required,
    /// `DATABASE_SCHEMA` defaulting to `public`); otherwise an embedded
    /// SQLite file is used.
    pub fn from_env<F>(lookup: F) -> Result<Self, IndexerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_production =
            |key: &str| lookup(key).is_some_and(|v| v.trim().eq_ignore_ascii_case("production"));
        let production = is_production("NODE_ENV")
            || is_production("INDEXER_ENV")
            || lookup("RAILWAY_ENVIRONMENT").is_some();
        if !production {
            return Ok(Self::Sqlite {
                path: default_sqlite_path(),
            });
        }

        let connection_string = lookup("DATABASE_URL").filter(|s| !s.is_empty()).ok_or_else(|| {
            IndexerError::config("DATABASE_URL must be set in production")
        })?;
        Ok(Self::Postgres {
            connection_string,
            schema: lookup("DATABASE_SCHEMA")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(default_schema),
            pool: PoolConfig::default(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
            Self::Sqlite { .. } => "sqlite",
            Self::Memory => "memory",
        }
    }
}

// ─── Logging ──────────────────────────────────────────────────────────────────

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `"info,factoryindex_evm=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const YAML: &str = r#"
chains:
  base:
    id: 8453
    rpc_url: https://mainnet.base.org
    confirmation_depth: 6
contracts:
  LendingPoolFactory:
    chain: base
    abi: abis/LendingPoolFactory.json
    role: factory
    addresses: ["0x42C5dFc5899160e9c4e2E139AfFe7472dDf4D86E"]
    start_block: 37140924
  LendingPool:
    chain: base
    abi: abis/LendingPool.json
    role: pool
    start_block: 37140924
    include_transaction_receipts: true
    discovered_by:
      contract: LendingPoolFactory
      event: LendingPoolCreated
      parameter: lendingPool
  LendingPoolRouter:
    chain: base
    abi: abis/LendingPoolRouter.json
    role: router
    start_block: 37140924
logging:
  level: debug
  components:
    factoryindex-evm: trace
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parses_with_defaults() {
        let config = IndexerConfig::from_yaml_str(YAML).unwrap();
        config.validate().unwrap();

        let base = config.chain("base").unwrap();
        assert_eq!(base.id, 8453);
        assert_eq!(base.confirmation_depth, 6);
        assert_eq!(base.batch_size, 500);
        assert_eq!(base.reorg_window, 128);
        assert_eq!(base.retry.max_retries, 5);
        assert_eq!(config.start_block("base"), 37_140_924);
        assert_eq!(config.logging.directives(), "debug,factoryindex_evm=trace");
    }

    #[test]
    fn derives_rules_and_static_addresses() {
        let config = IndexerConfig::from_yaml_str(YAML).unwrap();

        let rules = config.discovery_rules("base");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source_abi_id, "LendingPoolFactory");
        assert_eq!(rules[0].child_role, ContractRole::Pool);
        assert_eq!(rules[0].child_abi_id, "LendingPool");

        let statics = config.static_addresses("base").unwrap();
        assert_eq!(statics.len(), 1);
        assert_eq!(
            statics[0].address,
            address!("42C5dFc5899160e9c4e2E139AfFe7472dDf4D86E")
        );
        assert_eq!(statics[0].discovered_at_block, 37_140_924);
        assert_eq!(statics[0].source, AddressSource::Static);

        let receipts = config.receipt_abis("base");
        assert_eq!(receipts.into_iter().collect::<Vec<_>>(), vec!["LendingPool"]);
        assert!(config.receipt_abis("optimism").is_empty());
    }

    #[test]
    fn rejects_unknown_discovery_source() {
        let yaml = YAML.replace("contract: LendingPoolFactory", "contract: Missing");
        let err = IndexerConfig::from_yaml_str(&yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("unknown contract 'Missing'"));
    }

    #[test]
    fn rejects_factory_without_addresses() {
        let yaml = YAML.replace(
            r#"addresses: ["0x42C5dFc5899160e9c4e2E139AfFe7472dDf4D86E"]"#,
            "addresses: []",
        );
        let err = IndexerConfig::from_yaml_str(&yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn rejects_unknown_chain_reference() {
        let yaml = YAML.replace("    chain: base\n    abi: abis/LendingPool.json", "    chain: optimism\n    abi: abis/LendingPool.json");
        let err = IndexerConfig::from_yaml_str(&yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("unknown chain 'optimism'"));
    }

    #[test]
    fn rpc_url_overridden_from_env() {
        let mut config = IndexerConfig::from_yaml_str(YAML).unwrap();
        config
            .apply_env(env(&[("base_RPC_URL", "http://localhost:8545")]))
            .unwrap();
        assert_eq!(config.chain("base").unwrap().rpc_url, "http://localhost:8545");

        let mut config = IndexerConfig::from_yaml_str(YAML).unwrap();
        config.apply_env(env(&[("BASE_RPC_URL", "http://node:8545")])).unwrap();
        assert_eq!(config.chain("base").unwrap().rpc_url, "http://node:8545");
    }

    #[test]
    fn database_selected_from_env() {
        assert_eq!(
            DatabaseConfig::from_env(env(&[])).unwrap(),
            DatabaseConfig::Sqlite {
                path: PathBuf::from(DEFAULT_SQLITE_PATH)
            }
        );

        let prod = DatabaseConfig::from_env(env(&[
            ("RAILWAY_ENVIRONMENT", "production"),
            ("DATABASE_URL", "postgres://u:p@db/indexer"),
        ]))
        .unwrap();
        let DatabaseConfig::Postgres { schema, pool, .. } = prod else {
            panic!("expected postgres");
        };
        assert_eq!(schema, "public");
        assert_eq!(pool.max_connections, 10);
        assert_eq!(pool.connect_timeout_ms, 10_000);
        assert_eq!(pool.idle_timeout_ms, 30_000);

        let missing = DatabaseConfig::from_env(env(&[("INDEXER_ENV", "production")]));
        assert!(missing.is_err());
    }

    #[test]
    fn node_env_production_selects_postgres() {
        let db = DatabaseConfig::from_env(env(&[
            ("NODE_ENV", "production"),
            ("DATABASE_URL", "postgres://u:p@db/indexer"),
            ("DATABASE_SCHEMA", "senja"),
        ]))
        .unwrap();
        assert_eq!(db.kind(), "postgres");
        let DatabaseConfig::Postgres { schema, .. } = db else {
            panic!("expected postgres");
        };
        assert_eq!(schema, "senja");

        let dev = DatabaseConfig::from_env(env(&[
            ("NODE_ENV", "development"),
            ("DATABASE_URL", "postgres://u:p@db/indexer"),
        ]))
        .unwrap();
        assert_eq!(dev.kind(), "sqlite");
    }

    #[test]
    fn explicit_database_section_wins() {
        let yaml = format!("{YAML}\ndatabase:\n  kind: memory\n");
        let mut config = IndexerConfig::from_yaml_str(&yaml).unwrap();
        config.apply_env(env(&[("INDEXER_ENV", "production")])).unwrap();
        assert_eq!(config.database, Some(DatabaseConfig::Memory));
    }
}
