//! SQLite storage backend for FactoryIndex.
//!
//! Persists checkpoints, watched addresses, and decoded events to a single
//! SQLite file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use factoryindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open(".factoryindex/index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::debug;

use factoryindex_core::checkpoint::{CheckpointStore, VersionedCursor};
use factoryindex_core::cursor::ChainCursor;
use factoryindex_core::error::IndexerError;
use factoryindex_core::handler::{EventHandler, ReorgHandler};
use factoryindex_core::registry::RegistryStore;
use factoryindex_core::reorg::ReorgEvent;
use factoryindex_core::types::{ChainId, DecodedEvent, IndexContext, WatchedAddress};

use crate::rows::{receipt_json, storage_err, AddressRow, CheckpointRow, EventRow};
use crate::{EventStore, StoredEvent};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoints (
        chain_id                 INTEGER PRIMARY KEY,
        last_processed_block     INTEGER NOT NULL,
        last_processed_log_index INTEGER NOT NULL,
        block_hash               TEXT,
        updated_at               INTEGER NOT NULL,
        version                  INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS watched_addresses (
        chain_id            INTEGER NOT NULL,
        address             TEXT    NOT NULL,
        role                TEXT    NOT NULL,
        abi_id              TEXT    NOT NULL,
        discovered_at_block INTEGER NOT NULL,
        source              TEXT    NOT NULL,
        factory             TEXT,
        tx_hash             TEXT,
        PRIMARY KEY (chain_id, address)
    );",
    "CREATE TABLE IF NOT EXISTS events (
        chain_id     INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        log_index    INTEGER NOT NULL,
        block_hash   TEXT    NOT NULL,
        tx_hash      TEXT,
        address      TEXT    NOT NULL,
        role         TEXT    NOT NULL,
        abi_id       TEXT    NOT NULL,
        event_name   TEXT    NOT NULL,
        args         TEXT    NOT NULL,
        receipt      TEXT,
        PRIMARY KEY (chain_id, block_number, log_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_events_name ON events (chain_id, event_name);",
];

/// SQLite-backed storage for checkpoints, watched addresses, and events.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`, creating parent
    /// directories as needed.
    ///
    /// The path may also be a full SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let raw = path.to_string_lossy();
        let url = if raw.starts_with("sqlite:") {
            raw.into_owned()
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    IndexerError::Storage(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            format!("sqlite:{raw}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        tracing::info!(path = %path.display(), "SQLite storage opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single long-lived connection; all data is lost when the pool is
    /// dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        // Databases created before receipts were stored lack the column.
        let has_receipt: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('events') WHERE name = 'receipt'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        if has_receipt == 0 {
            sqlx::query("ALTER TABLE events ADD COLUMN receipt TEXT")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn current_version(&self, chain_id: ChainId) -> Result<Option<u64>, IndexerError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM checkpoints WHERE chain_id = ?")
                .bind(chain_id as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(version.map(|v| v as u64))
    }

    /// Insert an event; a replay of the same `(chain, block, log_index)` replaces it.
    pub async fn insert_event(&self, event: &StoredEvent) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO events
             (chain_id, block_number, log_index, block_hash, tx_hash, address, role, abi_id, event_name, args, receipt)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.chain_id as i64)
        .bind(event.block_number as i64)
        .bind(event.log_index as i64)
        .bind(event.block_hash.to_string())
        .bind(event.tx_hash.map(|h| h.to_string()))
        .bind(event.address.to_string())
        .bind(event.role.as_str())
        .bind(&event.abi_id)
        .bind(&event.event_name)
        .bind(&event.args)
        .bind(receipt_json(event)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(event = %event.event_name, block = event.block_number, "event stored");
        Ok(())
    }

    /// Delete events of `chain_id` at blocks after `block_number` (reorg recovery).
    pub async fn rollback_after(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM events WHERE chain_id = ? AND block_number > ?")
            .bind(chain_id as i64)
            .bind(block_number as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        debug!(chain_id, block_number, removed = result.rows_affected(), "rolled back events");
        Ok(result.rows_affected())
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, chain_id: ChainId) -> Result<Option<VersionedCursor>, IndexerError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT chain_id, last_processed_block, last_processed_log_index, block_hash, updated_at, version
             FROM checkpoints WHERE chain_id = ?",
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(CheckpointRow::into_versioned).transpose()
    }

    async fn save(
        &self,
        cursor: &ChainCursor,
        expected_version: Option<u64>,
    ) -> Result<u64, IndexerError> {
        let hash = cursor.block_hash.map(|h| h.to_string());
        let result = match expected_version {
            None => sqlx::query(
                "INSERT INTO checkpoints
                 (chain_id, last_processed_block, last_processed_log_index, block_hash, updated_at, version)
                 VALUES (?, ?, ?, ?, ?, 1)
                 ON CONFLICT (chain_id) DO NOTHING",
            )
            .bind(cursor.chain_id as i64)
            .bind(cursor.last_processed_block as i64)
            .bind(cursor.last_processed_log_index as i64)
            .bind(hash)
            .bind(cursor.updated_at)
            .execute(&self.pool)
            .await,
            Some(version) => sqlx::query(
                "UPDATE checkpoints SET
                    last_processed_block = ?, last_processed_log_index = ?,
                    block_hash = ?, updated_at = ?, version = version + 1
                 WHERE chain_id = ? AND version = ?",
            )
            .bind(cursor.last_processed_block as i64)
            .bind(cursor.last_processed_log_index as i64)
            .bind(hash)
            .bind(cursor.updated_at)
            .bind(cursor.chain_id as i64)
            .bind(version as i64)
            .execute(&self.pool)
            .await,
        }
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(IndexerError::VersionConflict {
                chain_id: cursor.chain_id,
                expected: expected_version,
                found: self.current_version(cursor.chain_id).await?,
            });
        }

        debug!(
            chain_id = cursor.chain_id,
            block = cursor.last_processed_block,
            "checkpoint saved"
        );
        Ok(expected_version.map_or(1, |v| v + 1))
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ?")
            .bind(chain_id as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── RegistryStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl RegistryStore for SqliteStorage {
    async fn load_addresses(&self, chain_id: ChainId) -> Result<Vec<WatchedAddress>, IndexerError> {
        let rows: Vec<AddressRow> = sqlx::query_as(
            "SELECT chain_id, address, role, abi_id, discovered_at_block, source, factory, tx_hash
             FROM watched_addresses WHERE chain_id = ?
             ORDER BY discovered_at_block, address",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(AddressRow::into_entry).collect()
    }

    async fn save_addresses(&self, entries: &[WatchedAddress]) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for entry in entries {
            let row = AddressRow::from_entry(entry);
            sqlx::query(
                "INSERT INTO watched_addresses
                 (chain_id, address, role, abi_id, discovered_at_block, source, factory, tx_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (chain_id, address) DO NOTHING",
            )
            .bind(row.chain_id)
            .bind(row.address)
            .bind(row.role)
            .bind(row.abi_id)
            .bind(row.discovered_at_block)
            .bind(row.source)
            .bind(row.factory)
            .bind(row.tx_hash)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn delete_discovered_after(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<u64, IndexerError> {
        let result = sqlx::query(
            "DELETE FROM watched_addresses
             WHERE chain_id = ? AND source = 'discovered' AND discovered_at_block > ?",
        )
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

// ─── Sink impls ──────────────────────────────────────────────────────────────

#[async_trait]
impl EventHandler for SqliteStorage {
    async fn handle(&self, event: &DecodedEvent, _ctx: &IndexContext) -> Result<(), IndexerError> {
        self.insert_event(&StoredEvent::from(event)).await
    }

    fn event_name(&self) -> Option<&str> {
        None
    }
}

#[async_trait]
impl ReorgHandler for SqliteStorage {
    async fn on_reorg(&self, reorg: &ReorgEvent, _ctx: &IndexContext) -> Result<(), IndexerError> {
        self.rollback_after(reorg.chain_id, reorg.safe_ancestor).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteStorage {
    async fn event_count(&self, chain_id: ChainId) -> Result<u64, IndexerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE chain_id = ?")
            .bind(chain_id as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn events(
        &self,
        chain_id: ChainId,
        event_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT chain_id, block_number, log_index, block_hash, tx_hash, address, role, abi_id, event_name, args, receipt
             FROM events
             WHERE chain_id = ? AND (? IS NULL OR event_name = ?)
             ORDER BY block_number, log_index
             LIMIT ?",
        )
        .bind(chain_id as i64)
        .bind(event_name)
        .bind(event_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn purge_chain(&self, chain_id: ChainId) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for table in ["events", "watched_addresses", "checkpoints"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE chain_id = ?"))
                .bind(chain_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        tracing::warn!(chain_id, "Chain state purged");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
