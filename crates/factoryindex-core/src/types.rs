//! Shared types for the indexing pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, Bytes, B256};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Numeric EVM chain id (e.g. `8453` for Base).
pub type ChainId = u64;

// ─── ContractRole ─────────────────────────────────────────────────────────────

/// Logical role of a watched contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractRole {
    /// Announces creation of other contracts.
    Factory,
    Pool,
    Router,
    Position,
}

impl ContractRole {
    pub const ALL: [ContractRole; 4] = [Self::Factory, Self::Pool, Self::Router, Self::Position];

    /// Returns `true` if a decode failure for this role would lose discovery data.
    pub fn is_discovery_critical(&self) -> bool {
        matches!(self, Self::Factory)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Factory => "factory",
            Self::Pool => "pool",
            Self::Router => "router",
            Self::Position => "position",
        }
    }
}

impl fmt::Display for ContractRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "factory" => Ok(Self::Factory),
            "pool" => Ok(Self::Pool),
            "router" => Ok(Self::Router),
            "position" => Ok(Self::Position),
            other => Err(format!("unknown contract role '{other}'")),
        }
    }
}

// ─── WatchedAddress ───────────────────────────────────────────────────────────

/// How an address entered the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AddressSource {
    /// Seeded from static configuration at startup.
    Static,
    /// Extracted from a factory creation event.
    Discovered {
        factory: Address,
        tx_hash: Option<B256>,
    },
}

/// A contract address the indexer is currently interested in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAddress {
    pub chain_id: ChainId,
    pub address: Address,
    pub role: ContractRole,
    /// Identifier of the ABI used to decode this contract's logs.
    pub abi_id: String,
    /// Start block for static entries, creation block for discovered ones.
    pub discovered_at_block: u64,
    pub source: AddressSource,
}

impl WatchedAddress {
    /// Returns `true` if logs of `block_number` should be filtered against this entry.
    ///
    /// Static entries are active from their start block; discovered entries only
    /// from the block after their creation event.
    pub fn visible_at(&self, block_number: u64) -> bool {
        match self.source {
            AddressSource::Static => block_number >= self.discovered_at_block,
            AddressSource::Discovered { .. } => block_number > self.discovered_at_block,
        }
    }

    pub fn is_discovered(&self) -> bool {
        matches!(self.source, AddressSource::Discovered { .. })
    }
}

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal block header: enough for parent-hash verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── RawLog ───────────────────────────────────────────────────────────────────

/// A log as fetched from the chain. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: Option<B256>,
    pub log_index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl RawLog {
    /// The event signature hash, if the log is not anonymous.
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }

    /// Sort key: `(block_number, log_index)`.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

// ─── TransactionReceipt ───────────────────────────────────────────────────────

/// The parts of a transaction receipt attached to events of contracts that
/// request them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub from: Address,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    /// `true` if the transaction succeeded.
    pub status: bool,
    pub gas_used: u64,
    pub effective_gas_price: Option<u128>,
}

/// All logs of a single block, ascending by log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLogs {
    pub number: u64,
    /// Block hash when known (from the header or from the logs themselves).
    pub hash: Option<B256>,
    pub logs: Vec<RawLog>,
    /// Receipts fetched for this block, by transaction hash.
    pub receipts: BTreeMap<B256, TransactionReceipt>,
}

impl BlockLogs {
    pub fn new(number: u64, hash: Option<B256>, logs: Vec<RawLog>) -> Self {
        Self {
            number,
            hash,
            logs,
            receipts: BTreeMap::new(),
        }
    }

    pub fn empty(number: u64) -> Self {
        Self::new(number, None, Vec::new())
    }

    /// Receipt of the transaction that emitted `log`, if it was fetched.
    pub fn receipt_for(&self, log: &RawLog) -> Option<&TransactionReceipt> {
        log.tx_hash.and_then(|tx| self.receipts.get(&tx))
    }

    /// Index of the last log in the block, `0` for an empty block.
    pub fn last_log_index(&self) -> u64 {
        self.logs.last().map(|l| l.log_index).unwrap_or(0)
    }
}

// ─── DecodedValue ─────────────────────────────────────────────────────────────

/// An ABI-decoded value, normalized for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DecodedValue {
    Bool(bool),
    /// Unsigned integer that fits in 128 bits.
    Uint(u128),
    /// Unsigned integer wider than 128 bits, decimal string.
    BigUint(String),
    Int(i128),
    BigInt(String),
    Address(Address),
    Bytes(Bytes),
    Str(String),
    Array(Vec<DecodedValue>),
    Tuple(Vec<(String, DecodedValue)>),
}

impl DecodedValue {
    pub fn as_address(&self) -> Option<Address> {
        match self {
            Self::Address(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }
}

// ─── DecodedEvent ─────────────────────────────────────────────────────────────

/// A log decoded against the ABI of its registered contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Event name from the ABI (e.g. `"LendingPoolCreated"`).
    pub event_name: String,
    /// Parameter name → value, in ABI declaration order.
    pub args: IndexMap<String, DecodedValue>,
    pub source_log: RawLog,
    /// Role of the emitting contract.
    pub role: ContractRole,
    /// ABI the log was decoded with.
    pub abi_id: String,
    /// Present only for contracts configured with transaction receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
}

impl DecodedEvent {
    pub fn arg(&self, name: &str) -> Option<&DecodedValue> {
        self.args.get(name)
    }

    pub fn block_number(&self) -> u64 {
        self.source_log.block_number
    }

    /// Serialize the arguments as a JSON object (storage sinks persist this).
    pub fn args_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.args).unwrap_or(serde_json::Value::Null)
    }
}

// ─── IndexContext ─────────────────────────────────────────────────────────────

/// Context passed to handlers during indexing.
#[derive(Debug, Clone)]
pub struct IndexContext {
    pub chain_id: ChainId,
    /// Chain name from configuration (e.g. `"base"`).
    pub chain: String,
    pub block_number: u64,
    pub block_hash: Option<B256>,
    pub phase: IndexPhase,
}

/// The current phase of the index loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Catching up to the confirmed head.
    Backfill,
    /// Following the confirmed head in real time.
    Live,
}

impl fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backfill => write!(f, "backfill"),
            Self::Live => write!(f, "live"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
