//! Address registry: the per-chain set of contracts currently of interest.
//!
//! Ownership is split between a single writer and any number of readers:
//!
//! - [`AddressRegistry`] is the writer. It is not `Clone`; the pipeline hands it
//!   to the [`FactoryDiscoveryEngine`](crate::discovery::FactoryDiscoveryEngine),
//!   which is the only component that registers addresses after startup.
//! - [`RegistryReader`] is a cheap, cloneable read handle used by the dispatcher.
//!
//! Reads are height-aware: [`RegistryReader::lookup_at`] only returns entries
//! visible at the requested block, so an address discovered in block N is
//! never applied to logs of block N or earlier, even if the registry already
//! knows it (restart or replay).

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::IndexerError;
use crate::types::{AddressSource, ChainId, ContractRole, WatchedAddress};

/// Persistence for watched addresses.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Load every persisted entry for a chain.
    async fn load_addresses(&self, chain_id: ChainId) -> Result<Vec<WatchedAddress>, IndexerError>;

    /// Insert entries; an entry whose `(chain_id, address)` already exists is left untouched.
    async fn save_addresses(&self, entries: &[WatchedAddress]) -> Result<(), IndexerError>;

    /// Delete discovered entries created after `block_number`. Returns how many were removed.
    async fn delete_discovered_after(
        &self,
        chain_id: ChainId,
        block_number: u64,
    ) -> Result<u64, IndexerError>;
}

/// Result of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The address was new and is now watched.
    Inserted(WatchedAddress),
    /// The address was already watched with the same role; nothing changed.
    AlreadyRegistered,
}

impl Registration {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Address, WatchedAddress>,
    by_role: HashMap<ContractRole, BTreeSet<Address>>,
}

impl Inner {
    fn insert(&mut self, entry: WatchedAddress) {
        self.by_role.entry(entry.role).or_default().insert(entry.address);
        self.entries.insert(entry.address, entry);
    }

    fn remove(&mut self, address: &Address) -> Option<WatchedAddress> {
        let entry = self.entries.remove(address)?;
        if let Some(set) = self.by_role.get_mut(&entry.role) {
            set.remove(address);
        }
        Some(entry)
    }
}

// ─── Writer ───────────────────────────────────────────────────────────────────

/// The single-writer side of a chain's address registry.
pub struct AddressRegistry {
    chain_id: ChainId,
    inner: Arc<RwLock<Inner>>,
    /// Entries inserted since the last [`take_pending`](Self::take_pending).
    pending: Vec<WatchedAddress>,
}

impl AddressRegistry {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            inner: Arc::new(RwLock::new(Inner::default())),
            pending: Vec::new(),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// A read handle observing this registry.
    pub fn reader(&self) -> RegistryReader {
        RegistryReader {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Register a statically configured address. Idempotent.
    pub fn register(
        &mut self,
        address: Address,
        role: ContractRole,
        abi_id: impl Into<String>,
        block_number: u64,
    ) -> Result<Registration, IndexerError> {
        self.insert(WatchedAddress {
            chain_id: self.chain_id,
            address,
            role,
            abi_id: abi_id.into(),
            discovered_at_block: block_number,
            source: AddressSource::Static,
        })
    }

    /// Register an address announced by `factory` at `block_number`. Idempotent.
    pub fn register_discovered(
        &mut self,
        address: Address,
        role: ContractRole,
        abi_id: impl Into<String>,
        block_number: u64,
        factory: Address,
        tx_hash: Option<B256>,
    ) -> Result<Registration, IndexerError> {
        self.insert(WatchedAddress {
            chain_id: self.chain_id,
            address,
            role,
            abi_id: abi_id.into(),
            discovered_at_block: block_number,
            source: AddressSource::Discovered { factory, tx_hash },
        })
    }

    fn insert(&mut self, entry: WatchedAddress) -> Result<Registration, IndexerError> {
        let mut inner = self.write();
        if let Some(existing) = inner.entries.get(&entry.address) {
            if existing.role != entry.role {
                return Err(IndexerError::RoleConflict {
                    address: entry.address,
                    existing: existing.role,
                    requested: entry.role,
                });
            }
            if existing.abi_id != entry.abi_id {
                tracing::warn!(
                    address = %entry.address,
                    existing = %existing.abi_id,
                    requested = %entry.abi_id,
                    "Address re-registered with a different ABI; keeping the original"
                );
            }
            return Ok(Registration::AlreadyRegistered);
        }

        tracing::debug!(
            chain_id = self.chain_id,
            address = %entry.address,
            role = %entry.role,
            block = entry.discovered_at_block,
            "Address registered"
        );
        inner.insert(entry.clone());
        drop(inner);
        self.pending.push(entry.clone());
        Ok(Registration::Inserted(entry))
    }

    /// Load previously persisted entries without queueing them for persistence again.
    pub fn restore(&mut self, entries: Vec<WatchedAddress>) -> Result<usize, IndexerError> {
        let mut inner = self.write();
        let mut restored = 0;
        for entry in entries {
            if entry.chain_id != self.chain_id {
                continue;
            }
            if let Some(existing) = inner.entries.get(&entry.address) {
                if existing.role != entry.role {
                    return Err(IndexerError::RoleConflict {
                        address: entry.address,
                        existing: existing.role,
                        requested: entry.role,
                    });
                }
                continue;
            }
            inner.insert(entry);
            restored += 1;
        }
        Ok(restored)
    }

    /// Drain entries inserted since the last call, for persistence.
    pub fn take_pending(&mut self) -> Vec<WatchedAddress> {
        std::mem::take(&mut self.pending)
    }

    /// Remove discovered entries created after `block_number` (reorg recovery).
    ///
    /// Static entries are never removed.
    pub fn rollback_after(&mut self, block_number: u64) -> Vec<WatchedAddress> {
        let mut inner = self.write();
        let stale: Vec<Address> = inner
            .entries
            .values()
            .filter(|e| e.is_discovered() && e.discovered_at_block > block_number)
            .map(|e| e.address)
            .collect();
        let removed: Vec<WatchedAddress> = stale.iter().filter_map(|a| inner.remove(a)).collect();
        drop(inner);

        self.pending
            .retain(|e| !(e.is_discovered() && e.discovered_at_block > block_number));
        removed
    }

    pub fn contains(&self, address: &Address) -> Option<ContractRole> {
        self.reader().contains(address)
    }

    pub fn addresses_for_role(&self, role: ContractRole) -> BTreeSet<Address> {
        self.reader().addresses_for_role(role)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Reader ───────────────────────────────────────────────────────────────────

/// Cloneable read handle onto an [`AddressRegistry`].
#[derive(Clone)]
pub struct RegistryReader {
    inner: Arc<RwLock<Inner>>,
}

impl RegistryReader {
    /// Role of `address`, regardless of height.
    pub fn contains(&self, address: &Address) -> Option<ContractRole> {
        self.read().entries.get(address).map(|e| e.role)
    }

    /// The entry for `address` if it is visible when filtering `block_number`.
    pub fn lookup_at(&self, address: &Address, block_number: u64) -> Option<WatchedAddress> {
        self.read()
            .entries
            .get(address)
            .filter(|e| e.visible_at(block_number))
            .cloned()
    }

    pub fn get(&self, address: &Address) -> Option<WatchedAddress> {
        self.read().entries.get(address).cloned()
    }

    pub fn addresses_for_role(&self, role: ContractRole) -> BTreeSet<Address> {
        self.read().by_role.get(&role).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// All entries, sorted by `(discovered_at_block, address)`.
    pub fn entries(&self) -> Vec<WatchedAddress> {
        let mut all: Vec<_> = self.read().entries.values().cloned().collect();
        all.sort_by_key(|e| (e.discovered_at_block, e.address));
        all
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
