//! Fluent builder API for creating chain pipelines.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use factoryindex_core::config::IndexerConfig;
//! use factoryindex_evm::{AbiRegistry, HttpRpcClient, IndexerBuilder};
//!
//! # async fn run() -> Result<(), factoryindex_core::IndexerError> {
//! let config = IndexerConfig::load("indexer.yaml")?;
//! let abis = Arc::new(AbiRegistry::from_config(&config)?);
//! let client = HttpRpcClient::default_for(&config.chain("base")?.rpc_url)?;
//!
//! let pipeline = IndexerBuilder::from_config(&config, "base")?
//!     .decoder(abis)
//!     .build(client)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use alloy_primitives::Address;

use factoryindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use factoryindex_core::config::{ChainConfig, IndexerConfig};
use factoryindex_core::decoder::LogDecoder;
use factoryindex_core::discovery::{DiscoveryRule, FactoryDiscoveryEngine};
use factoryindex_core::dispatcher::EventDispatcher;
use factoryindex_core::error::IndexerError;
use factoryindex_core::handler::{BlockHandler, EventHandler, HandlerRegistry, ReorgHandler};
use factoryindex_core::registry::{AddressRegistry, RegistryStore};
use factoryindex_core::retry::{RetryConfig, RetryPolicy};
use factoryindex_core::types::{AddressSource, ContractRole, WatchedAddress};
use factoryindex_storage::{InMemoryStorage, Storage};

use crate::fetcher::ChainLogSource;
use crate::index_loop::{BlockProcessor, ChainPipeline};
use crate::rpc::EvmRpcClient;

/// Fluent builder for a [`ChainPipeline`].
pub struct IndexerBuilder {
    chain: String,
    config: ChainConfig,
    start_block: u64,
    statics: Vec<WatchedAddress>,
    rules: Vec<DiscoveryRule>,
    receipt_abis: BTreeSet<String>,
    decoder: Option<Arc<dyn LogDecoder>>,
    handlers: HandlerRegistry,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    registry_store: Option<Arc<dyn RegistryStore>>,
}

impl IndexerBuilder {
    pub fn new(chain: impl Into<String>, config: ChainConfig) -> Self {
        Self {
            chain: chain.into(),
            start_block: config.start_block.unwrap_or(0),
            config,
            statics: Vec::new(),
            rules: Vec::new(),
            receipt_abis: BTreeSet::new(),
            decoder: None,
            handlers: HandlerRegistry::new(),
            checkpoint_store: None,
            registry_store: None,
        }
    }

    /// Chain settings, static addresses, and discovery rules of `chain`.
    pub fn from_config(config: &IndexerConfig, chain: &str) -> Result<Self, IndexerError> {
        let mut builder = Self::new(chain, config.chain(chain)?.clone());
        builder.start_block = config.start_block(chain);
        builder.statics = config.static_addresses(chain)?;
        builder.rules = config.discovery_rules(chain);
        builder.receipt_abis = config.receipt_abis(chain);
        Ok(builder)
    }

    /// Set the first block to index when no checkpoint exists.
    pub fn start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    /// Set the end block (for bounded backfill).
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Set confirmation depth (blocks behind head before processing).
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Set the number of blocks per batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the widest block range of a single `eth_getLogs` call.
    pub fn max_log_range(mut self, range: u64) -> Self {
        self.config.max_log_range = range;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set how many recent headers are kept for reorg detection.
    pub fn reorg_window(mut self, blocks: usize) -> Self {
        self.config.reorg_window = blocks;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Watch a statically known contract from `from_block` on.
    pub fn watch(
        mut self,
        address: Address,
        role: ContractRole,
        abi_id: impl Into<String>,
        from_block: u64,
    ) -> Self {
        self.statics.push(WatchedAddress {
            chain_id: self.config.id,
            address,
            role,
            abi_id: abi_id.into(),
            discovered_at_block: from_block,
            source: AddressSource::Static,
        });
        self
    }

    /// Add a factory discovery rule.
    pub fn discovery_rule(mut self, rule: DiscoveryRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Attach transaction receipts to events decoded with `abi_id`.
    pub fn include_receipts(mut self, abi_id: impl Into<String>) -> Self {
        self.receipt_abis.insert(abi_id.into());
        self
    }

    /// Set the ABI decoder (required).
    pub fn decoder(mut self, decoder: Arc<dyn LogDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn on_event(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.on_event(handler);
        self
    }

    pub fn on_block(mut self, handler: Arc<dyn BlockHandler>) -> Self {
        self.handlers.on_block(handler);
        self
    }

    pub fn on_reorg(mut self, handler: Arc<dyn ReorgHandler>) -> Self {
        self.handlers.on_reorg(handler);
        self
    }

    /// Register a sink that receives every event and purges on reorg.
    pub fn sink<S>(self, sink: Arc<S>) -> Self
    where
        S: EventHandler + ReorgHandler + 'static,
    {
        self.on_event(sink.clone()).on_reorg(sink)
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn registry_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.registry_store = Some(store);
        self
    }

    /// Use one backend for both checkpoints and watched addresses.
    pub fn storage<S>(self, store: Arc<S>) -> Self
    where
        S: CheckpointStore + RegistryStore + 'static,
    {
        self.checkpoint_store(store.clone()).registry_store(store)
    }

    /// Persist checkpoints, watched addresses, and events in a connected backend.
    pub fn backend(self, storage: &Storage) -> Self {
        self.checkpoint_store(storage.checkpoints.clone())
            .registry_store(storage.registry.clone())
            .on_event(storage.sink.clone())
            .on_reorg(storage.reorgs.clone())
    }

    /// Open the checkpoint, rebuild the registry, and assemble the pipeline.
    ///
    /// The registry is rebuilt from the store (minus discoveries the
    /// checkpoint does not cover) and then seeded with static addresses. A
    /// static address that conflicts with a known role is an error.
    pub async fn build<C: EvmRpcClient>(self, client: C) -> Result<ChainPipeline<C>, IndexerError> {
        let decoder = self
            .decoder
            .ok_or_else(|| IndexerError::config("a log decoder is required"))?;
        for abi_id in self
            .statics
            .iter()
            .map(|s| &s.abi_id)
            .chain(self.rules.iter().flat_map(|r| [&r.source_abi_id, &r.child_abi_id]))
        {
            if !decoder.has_abi(abi_id) {
                return Err(IndexerError::config(format!("ABI '{abi_id}' is not registered")));
            }
        }

        let chain_id = self.config.id;
        let memory = Arc::new(InMemoryStorage::new());
        let checkpoint_store: Arc<dyn CheckpointStore> = match self.checkpoint_store {
            Some(store) => store,
            None => memory.clone(),
        };
        let registry_store: Arc<dyn RegistryStore> = match self.registry_store {
            Some(store) => store,
            None => memory,
        };

        let checkpoint = CheckpointManager::open(checkpoint_store, chain_id, self.start_block).await?;

        let covered = checkpoint.resume_block().saturating_sub(1);
        let stale = registry_store.delete_discovered_after(chain_id, covered).await?;
        if stale > 0 {
            tracing::warn!(chain_id, after = covered, stale, "Dropped discoveries past the checkpoint");
        }

        let mut registry = AddressRegistry::new(chain_id);
        let restored = registry.restore(registry_store.load_addresses(chain_id).await?)?;
        for entry in self.statics {
            registry.register(entry.address, entry.role, entry.abi_id, entry.discovered_at_block)?;
        }

        let discovery = FactoryDiscoveryEngine::new(registry, self.rules);
        let dispatcher = EventDispatcher::new(
            chain_id,
            self.chain.clone(),
            discovery.reader(),
            decoder,
            Arc::new(self.handlers),
        )
        .with_discovery_sources(discovery.source_abis());
        let mut processor = BlockProcessor::new(dispatcher, discovery, checkpoint, registry_store)
            .with_receipt_abis(self.receipt_abis);
        let seeded = processor.flush_registry().await?;

        let mut source = ChainLogSource::new(
            client,
            chain_id,
            self.config.max_log_range,
            self.config.reorg_window,
            RetryPolicy::new(self.config.retry.clone()),
        );
        if let Some(cursor) = processor.checkpoint().current_cursor() {
            if let Some(hash) = cursor.block_hash {
                source.seed(cursor.last_processed_block, hash);
            }
        }

        tracing::info!(
            chain = %self.chain,
            chain_id,
            restored,
            seeded,
            rules = processor.discovery().rules().len(),
            receipts = processor.receipt_addresses().len(),
            "Pipeline built"
        );
        Ok(ChainPipeline::new(self.chain, self.config, source, processor))
    }
}
