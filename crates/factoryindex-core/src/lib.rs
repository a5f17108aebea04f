//! factoryindex-core: foundation for the dynamic contract-discovery indexer.
//!
//! # Architecture
//!
//! ```text
//! ChainLogSource (evm) → EventDispatcher ──→ HandlerRegistry (downstream sinks)
//!                             │  reads
//!                             ▼
//!                      RegistryReader ◄── AddressRegistry ◄── FactoryDiscoveryEngine
//!                                                                  │
//!                                           CheckpointManager ◄────┘ (after full dispatch)
//! ```
//!
//! - [`registry`]: per-chain set of watched addresses, single writer / many readers
//! - [`discovery`]: turns factory creation events into registry entries
//! - [`dispatcher`]: filters, decodes, and routes one block of logs at a time
//! - [`checkpoint`]: monotonic per-chain cursor with versioned persistence
//! - [`tracker`] / [`reorg`]: header window and fork-point bookkeeping

pub mod checkpoint;
pub mod config;
pub mod cursor;
pub mod decoder;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod registry;
pub mod reorg;
pub mod retry;
pub mod tracker;
pub mod types;

pub use checkpoint::{CheckpointManager, CheckpointStore, MemoryCheckpointStore, VersionedCursor};
pub use config::{ChainConfig, ContractConfig, DatabaseConfig, IndexerConfig, LogConfig};
pub use cursor::ChainCursor;
pub use decoder::{DecodedLog, LogDecoder};
pub use discovery::{DiscoveryReport, DiscoveryRule, FactoryDiscoveryEngine};
pub use dispatcher::{DispatchOutcome, DispatcherState, EventDispatcher};
pub use error::{DecodeError, IndexerError};
pub use handler::{BlockHandler, EventHandler, HandlerRegistry, ReorgHandler};
pub use registry::{AddressRegistry, Registration, RegistryReader, RegistryStore};
pub use reorg::{ReorgDetector, ReorgEvent};
pub use retry::{RetryConfig, RetryPolicy};
pub use tracker::BlockTracker;
pub use types::{
    AddressSource, BlockLogs, BlockSummary, ChainId, ContractRole, DecodedEvent, DecodedValue,
    IndexContext, IndexPhase, RawLog, TransactionReceipt, WatchedAddress,
};
