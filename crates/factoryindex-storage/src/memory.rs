//! In-memory storage backend.
//!
//! Stores checkpoints, watched addresses, and decoded events in RAM.
//! Useful for testing and short-lived indexers that don't need persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use alloy_primitives::Address;
use async_trait::async_trait;

use factoryindex_core::checkpoint::{CheckpointStore, VersionedCursor};
use factoryindex_core::cursor::ChainCursor;
use factoryindex_core::error::IndexerError;
use factoryindex_core::handler::{EventHandler, ReorgHandler};
use factoryindex_core::registry::RegistryStore;
use factoryindex_core::reorg::ReorgEvent;
use factoryindex_core::types::{ChainId, DecodedEvent, IndexContext, WatchedAddress};

use crate::{EventStore, StoredEvent};

/// In-memory indexer storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<ChainId, VersionedCursor>>,
    addresses: Mutex<HashMap<(ChainId, Address), WatchedAddress>>,
    /// Keyed by `(chain_id, block_number, log_index)`.
    events: Mutex<BTreeMap<(ChainId, u64, u64), StoredEvent>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded event. Replays of the same position overwrite it.
    pub fn insert_event(&self, event: StoredEvent) {
        lock(&self.events).insert((event.chain_id, event.block_number, event.log_index), event);
    }

    /// All stored events of `chain_id` named `event_name`.
    pub fn events_by_name(&self, chain_id: ChainId, event_name: &str) -> Vec<StoredEvent> {
        lock(&self.events)
            .values()
            .filter(|e| e.chain_id == chain_id && e.event_name == event_name)
            .cloned()
            .collect()
    }

    /// Total number of stored events across chains.
    pub fn total_events(&self) -> usize {
        lock(&self.events).len()
    }

    /// Delete events of `chain_id` at blocks after `block_number` (reorg recovery).
    pub fn rollback_after(&self, chain_id: ChainId, block_number: u64) -> usize {
        let mut events = lock(&self.events);
        let before = events.len();
        events.retain(|(chain, block, _), _| *chain != chain_id || *block <= block_number);
        before - events.len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, chain_id: ChainId) -> Result<Option<VersionedCursor>, IndexerError> {
        Ok(lock(&self.checkpoints).get(&chain_id).cloned())
    }

    async fn save(
        &self,
        cursor: &ChainCursor,
        expected_version: Option<u64>,
    ) -> Result<u64, IndexerError> {
        let mut checkpoints = lock(&self.checkpoints);
        let found = checkpoints.get(&cursor.chain_id).map(|v| v.version);
        if found != expected_version {
            return Err(IndexerError::VersionConflict {
                chain_id: cursor.chain_id,
                expected: expected_version,
                found,
            });
        }
        let version = found.map_or(1, |v| v + 1);
        checkpoints.insert(
            cursor.chain_id,
            VersionedCursor {
                cursor: cursor.clone(),
                version,
            },
        );
        Ok(version)
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), IndexerError> {
        lock(&self.checkpoints).remove(&chain_id);
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for InMemoryStorage {
    async fn load_addresses(&self, chain_id: ChainId) -> Result<Vec<WatchedAddress>, IndexerError> {
        let mut entries: Vec<WatchedAddress> = lock(&self.addresses)
            .values()
            .filter(|e| e.chain_id == chain_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.discovered_at_block, e.address));
        Ok(entries)
    }

    async fn save_addresses(&self, entries: &[WatchedAddress]) -> Result<(), IndexerError> {
        let mut addresses = lock(&self.addresses);
        for entry in entries {
            addresses
                .entry((entry.chain_id, entry.address))
                .or_insert_with(|| entry.clone());
        }
        Ok(())
    }

    async fn delete_discovered_after(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<u64, IndexerError> {
        let mut addresses = lock(&self.addresses);
        let before = addresses.len();
        addresses.retain(|(chain, _), e| {
            *chain != chain_id || !e.is_discovered() || e.discovered_at_block <= block_number
        });
        Ok((before - addresses.len()) as u64)
    }
}

#[async_trait]
impl EventHandler for InMemoryStorage {
    async fn handle(&self, event: &DecodedEvent, _ctx: &IndexContext) -> Result<(), IndexerError> {
        self.insert_event(StoredEvent::from(event));
        Ok(())
    }

    fn event_name(&self) -> Option<&str> {
        None
    }
}

#[async_trait]
impl ReorgHandler for InMemoryStorage {
    async fn on_reorg(&self, reorg: &ReorgEvent, _ctx: &IndexContext) -> Result<(), IndexerError> {
        let removed = self.rollback_after(reorg.chain_id, reorg.safe_ancestor);
        tracing::debug!(chain_id = reorg.chain_id, removed, "Events rolled back");
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryStorage {
    async fn event_count(&self, chain_id: ChainId) -> Result<u64, IndexerError> {
        Ok(lock(&self.events)
            .keys()
            .filter(|(chain, _, _)| *chain == chain_id)
            .count() as u64)
    }

    async fn events(
        &self,
        chain_id: ChainId,
        event_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, IndexerError> {
        Ok(lock(&self.events)
            .values()
            .filter(|e| e.chain_id == chain_id)
            .filter(|e| event_name.map_or(true, |name| e.event_name == name))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_chain(&self, chain_id: ChainId) -> Result<(), IndexerError> {
        lock(&self.events).retain(|(chain, _, _), _| *chain != chain_id);
        lock(&self.addresses).retain(|(chain, _), _| *chain != chain_id);
        lock(&self.checkpoints).remove(&chain_id);
        Ok(())
    }
}
