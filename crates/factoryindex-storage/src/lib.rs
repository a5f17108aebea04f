//! factoryindex-storage: pluggable storage backends for FactoryIndex.
//!
//! Every backend persists three things per chain: the checkpoint cursor, the
//! watched-address registry, and the decoded events routed to it as a sink.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx` (production)

use std::sync::Arc;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use factoryindex_core::checkpoint::CheckpointStore;
use factoryindex_core::config::DatabaseConfig;
use factoryindex_core::error::IndexerError;
use factoryindex_core::handler::{EventHandler, ReorgHandler};
use factoryindex_core::registry::RegistryStore;
use factoryindex_core::types::{ChainId, ContractRole, DecodedEvent, TransactionReceipt};

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod rows;

pub use memory::InMemoryStorage;

// ─── Stored events ────────────────────────────────────────────────────────────

/// A decoded event as persisted by a storage sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub log_index: u64,
    pub block_hash: B256,
    pub tx_hash: Option<B256>,
    pub address: Address,
    pub role: ContractRole,
    pub abi_id: String,
    pub event_name: String,
    /// Arguments as a JSON object, in ABI declaration order.
    pub args: serde_json::Value,
    /// Receipt of the emitting transaction, for contracts that opt in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
}

impl From<&DecodedEvent> for StoredEvent {
    fn from(event: &DecodedEvent) -> Self {
        let log = &event.source_log;
        Self {
            chain_id: log.chain_id,
            block_number: log.block_number,
            log_index: log.log_index,
            block_hash: log.block_hash,
            tx_hash: log.tx_hash,
            address: log.address,
            role: event.role,
            abi_id: event.abi_id.clone(),
            event_name: event.event_name.clone(),
            args: event.args_json(),
            receipt: event.receipt.clone(),
        }
    }
}

/// Read and administration access to stored events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Number of events stored for a chain.
    async fn event_count(&self, chain_id: ChainId) -> Result<u64, IndexerError>;

    /// Events of a chain ordered by `(block_number, log_index)`, optionally
    /// filtered by event name, at most `limit`.
    async fn events(
        &self,
        chain_id: ChainId,
        event_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, IndexerError>;

    /// Remove every event, watched address, and checkpoint of a chain.
    async fn purge_chain(&self, chain_id: ChainId) -> Result<(), IndexerError>;
}

// ─── Storage handle ───────────────────────────────────────────────────────────

/// One connected backend, viewed through each of its roles.
#[derive(Clone)]
pub struct Storage {
    kind: &'static str,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub registry: Arc<dyn RegistryStore>,
    pub events: Arc<dyn EventStore>,
    pub sink: Arc<dyn EventHandler>,
    pub reorgs: Arc<dyn ReorgHandler>,
}

impl Storage {
    pub fn new<S>(kind: &'static str, backend: Arc<S>) -> Self
    where
        S: CheckpointStore + RegistryStore + EventStore + EventHandler + ReorgHandler + 'static,
    {
        Self {
            kind,
            checkpoints: backend.clone(),
            registry: backend.clone(),
            events: backend.clone(),
            sink: backend.clone(),
            reorgs: backend,
        }
    }

    pub fn memory() -> Self {
        Self::new("memory", Arc::new(InMemoryStorage::new()))
    }

    /// `"memory"`, `"sqlite"`, or `"postgres"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

/// Connect to the backend described by `config`.
///
/// Fails with [`IndexerError::Config`] when the backend's feature is not compiled in.
pub async fn connect(config: &DatabaseConfig) -> Result<Storage, IndexerError> {
    let storage = match config {
        DatabaseConfig::Memory => Storage::memory(),

        #[cfg(feature = "sqlite")]
        DatabaseConfig::Sqlite { path } => {
            Storage::new("sqlite", Arc::new(sqlite::SqliteStorage::open(path).await?))
        }

        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres {
            connection_string,
            schema,
            pool,
        } => Storage::new(
            "postgres",
            Arc::new(postgres::PostgresStorage::connect(connection_string, schema, pool).await?),
        ),

        #[allow(unreachable_patterns)]
        other => {
            return Err(IndexerError::config(format!(
                "storage backend '{}' is not enabled in this build",
                other.kind()
            )))
        }
    };
    tracing::info!(kind = storage.kind(), "Storage connected");
    Ok(storage)
}
