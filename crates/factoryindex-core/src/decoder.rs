//! The decoding seam between the dispatcher and a concrete ABI implementation.

use indexmap::IndexMap;

use crate::error::DecodeError;
use crate::types::{DecodedValue, RawLog};

/// Name and arguments of a decoded log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub event_name: String,
    pub args: IndexMap<String, DecodedValue>,
}

/// Decodes raw logs against a registered ABI.
///
/// Implemented by `factoryindex_evm::AbiRegistry`.
pub trait LogDecoder: Send + Sync {
    /// Decode `log` using the ABI registered under `abi_id`.
    fn decode(&self, log: &RawLog, abi_id: &str) -> Result<DecodedLog, DecodeError>;

    /// Returns `true` if an ABI is registered under `abi_id`.
    fn has_abi(&self, abi_id: &str) -> bool;
}
