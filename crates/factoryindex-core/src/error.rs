//! Error types for the factoryindex pipeline.

use alloy_primitives::Address;
use thiserror::Error;

use crate::reorg::ReorgEvent;
use crate::types::{ChainId, ContractRole};

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// RPC timeout, connection failure, or rate limit. Retried with backoff.
    #[error("transient network error: {reason}")]
    TransientNetwork { reason: String },

    #[error("gave up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// A previously fetched block was invalidated. Triggers the rollback protocol.
    #[error(
        "chain reorg on chain {}: block {} invalidated, safe ancestor {}",
        .0.chain_id,
        .0.invalidated_block,
        .0.safe_ancestor
    )]
    ChainReorg(Box<ReorgEvent>),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Decode failure on a discovery-critical contract; never skipped.
    #[error("discovery-critical log from {address} at block {block_number} failed to decode: {source}")]
    CriticalDecode {
        address: Address,
        block_number: u64,
        #[source]
        source: DecodeError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("address {address} is registered as {existing}, cannot register it as {requested}")]
    RoleConflict {
        address: Address,
        existing: ContractRole,
        requested: ContractRole,
    },

    /// Node-side JSON-RPC error (not retryable).
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("checkpoint version conflict on chain {chain_id}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        chain_id: ChainId,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// Returns `true` if the error is a reorg (recoverable by rollback).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ChainReorg(_))
    }

    /// Returns `true` if the error must stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TransientNetwork { .. } | Self::ChainReorg(_) | Self::Decode(_)
        )
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}

/// Errors produced while decoding a log or extracting values from it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("ABI '{abi_id}' is not registered")]
    UnknownAbi { abi_id: String },

    #[error("log has no topics (anonymous event)")]
    AnonymousLog,

    #[error("no event in ABI '{abi_id}' matches topic0 {topic0}")]
    UnknownEvent { abi_id: String, topic0: String },

    #[error("failed to decode '{event}': {reason}")]
    AbiDecodeFailed { event: String, reason: String },

    #[error("event '{event}' has no parameter '{parameter}'")]
    MissingParameter { event: String, parameter: String },

    #[error("parameter '{parameter}' of '{event}' is not an address")]
    NotAnAddress { event: String, parameter: String },

    #[error("parameter '{parameter}' of '{event}' is the zero address")]
    ZeroAddress { event: String, parameter: String },
}
