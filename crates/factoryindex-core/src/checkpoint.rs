//! Checkpoint manager: persists each chain's cursor for crash recovery.
//!
//! The cursor only moves forward, and only after a block has been fully
//! dispatched. On restart the indexer resumes at `last_processed_block + 1`.
//! Stores expose get / put-with-version semantics so two writers can never
//! silently overwrite each other's progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cursor::ChainCursor;
use crate::error::IndexerError;
use crate::types::ChainId;

/// A stored cursor together with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedCursor {
    pub cursor: ChainCursor,
    pub version: u64,
}

/// Trait for storing and loading chain cursors.
///
/// Implementations include [`MemoryCheckpointStore`] and the SQLite / Postgres
/// backends in `factoryindex-storage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the cursor for a chain.
    async fn load(&self, chain_id: ChainId) -> Result<Option<VersionedCursor>, IndexerError>;

    /// Store `cursor` if the current version equals `expected_version`
    /// (`None` = no cursor stored yet). Returns the new version.
    async fn save(
        &self,
        cursor: &ChainCursor,
        expected_version: Option<u64>,
    ) -> Result<u64, IndexerError>;

    /// Delete a chain's cursor (e.g. when resetting an indexer).
    async fn delete(&self, chain_id: ChainId) -> Result<(), IndexerError>;
}

/// Owns the cursor of one chain and guards its monotonicity.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    chain_id: ChainId,
    start_block: u64,
    current: Option<ChainCursor>,
    version: Option<u64>,
}

impl CheckpointManager {
    /// Load the persisted cursor for `chain_id` (if any).
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        chain_id: ChainId,
        start_block: u64,
    ) -> Result<Self, IndexerError> {
        let loaded = store.load(chain_id).await?;
        if let Some(v) = &loaded {
            tracing::info!(
                chain_id,
                block = v.cursor.last_processed_block,
                log_index = v.cursor.last_processed_log_index,
                "Loaded checkpoint"
            );
        }
        Ok(Self {
            store,
            chain_id,
            start_block,
            version: loaded.as_ref().map(|v| v.version),
            current: loaded.map(|v| v.cursor),
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// The cursor as of the last fully processed block.
    pub fn current_cursor(&self) -> Option<&ChainCursor> {
        self.current.as_ref()
    }

    /// First block to fetch: cursor + 1, or the start block on a fresh chain.
    pub fn resume_block(&self) -> u64 {
        match &self.current {
            Some(c) => c.next_block(),
            None => self.start_block,
        }
    }

    /// Move the cursor to `(block_number, log_index)`.
    ///
    /// Returns `Ok(false)` without touching the store when the position is not
    /// strictly after the current cursor (duplicate replay).
    pub async fn advance(
        &mut self,
        block_number: u64,
        log_index: u64,
        block_hash: Option<B256>,
    ) -> Result<bool, IndexerError> {
        if let Some(current) = &self.current {
            if !current.is_before(block_number, log_index) {
                tracing::debug!(
                    chain_id = self.chain_id,
                    block_number,
                    log_index,
                    current = current.last_processed_block,
                    "Checkpoint not advanced (not ahead of cursor)"
                );
                return Ok(false);
            }
        }

        let cursor = ChainCursor::new(self.chain_id, block_number, log_index, block_hash);
        let version = self.store.save(&cursor, self.version).await?;
        self.current = Some(cursor);
        self.version = Some(version);
        Ok(true)
    }

    /// Move the cursor back to `safe_ancestor` after a reorg.
    ///
    /// Rolling back below the start block removes the checkpoint entirely.
    pub async fn rollback_to(
        &mut self,
        safe_ancestor: u64,
        block_hash: Option<B256>,
    ) -> Result<(), IndexerError> {
        let Some(current) = &self.current else {
            return Ok(());
        };
        if current.last_processed_block <= safe_ancestor {
            return Ok(());
        }

        let from = current.last_processed_block;
        if safe_ancestor < self.start_block {
            self.store.delete(self.chain_id).await?;
            self.current = None;
            self.version = None;
        } else {
            let cursor = ChainCursor::new(self.chain_id, safe_ancestor, 0, block_hash);
            let version = self.store.save(&cursor, self.version).await?;
            self.current = Some(cursor);
            self.version = Some(version);
        }

        tracing::warn!(
            chain_id = self.chain_id,
            from,
            to = safe_ancestor,
            "Checkpoint rolled back"
        );
        Ok(())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store for tests and ephemeral indexers.
#[derive(Default, Clone)]
pub struct MemoryCheckpointStore {
    data: Arc<Mutex<HashMap<ChainId, VersionedCursor>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, chain_id: ChainId) -> Result<Option<VersionedCursor>, IndexerError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(&chain_id).cloned())
    }

    async fn save(
        &self,
        cursor: &ChainCursor,
        expected_version: Option<u64>,
    ) -> Result<u64, IndexerError> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let found = data.get(&cursor.chain_id).map(|v| v.version);
        if found != expected_version {
            return Err(IndexerError::VersionConflict {
                chain_id: cursor.chain_id,
                expected: expected_version,
                found,
            });
        }
        let version = found.map_or(1, |v| v + 1);
        data.insert(
            cursor.chain_id,
            VersionedCursor {
                cursor: cursor.clone(),
                version,
            },
        );
        Ok(version)
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), IndexerError> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chain_id);
        Ok(())
    }
}
