//! ABI registry: decodes raw logs against the ABI registered for a contract.
//!
//! ABIs are keyed by id (the contract name in configuration). Each ABI's
//! events are indexed by selector (topic0), so decoding a log is one map
//! lookup plus an alloy `decode_log_parts` call.

use std::collections::HashMap;
use std::path::Path;

use alloy_dyn_abi::EventExt;
use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::B256;
use indexmap::IndexMap;

use factoryindex_core::config::IndexerConfig;
use factoryindex_core::decoder::{DecodedLog, LogDecoder};
use factoryindex_core::error::{DecodeError, IndexerError};
use factoryindex_core::types::RawLog;

use crate::normalizer;

/// Events of one ABI, by selector.
#[derive(Debug, Clone, Default)]
struct EventTable {
    by_selector: HashMap<B256, Event>,
}

/// All registered ABIs.
#[derive(Debug, Clone, Default)]
pub struct AbiRegistry {
    abis: HashMap<String, EventTable>,
}

impl AbiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `abi` under `abi_id`. Anonymous events are ignored.
    pub fn insert(&mut self, abi_id: impl Into<String>, abi: &JsonAbi) {
        let mut table = EventTable::default();
        for event in abi.events() {
            if event.anonymous {
                continue;
            }
            table.by_selector.insert(event.selector(), event.clone());
        }
        self.abis.insert(abi_id.into(), table);
    }

    /// Parse and register ABI JSON (plain array or artifact with an `abi` field).
    pub fn insert_json(&mut self, abi_id: impl Into<String>, json: &str) -> Result<(), IndexerError> {
        let abi_id = abi_id.into();
        let abi = parse_abi_json(json)
            .map_err(|e| IndexerError::Config(format!("ABI '{abi_id}': {e}")))?;
        self.insert(abi_id, &abi);
        Ok(())
    }

    /// Read and register an ABI file.
    pub fn load_file(&mut self, abi_id: impl Into<String>, path: &Path) -> Result<(), IndexerError> {
        let abi_id = abi_id.into();
        let json = std::fs::read_to_string(path).map_err(|e| {
            IndexerError::Config(format!("ABI '{abi_id}': cannot read {}: {e}", path.display()))
        })?;
        self.insert_json(abi_id, &json)
    }

    /// Load every contract ABI referenced by `config` and check its discovery rules.
    pub fn from_config(config: &IndexerConfig) -> Result<Self, IndexerError> {
        let mut registry = Self::new();
        for (name, contract) in &config.contracts {
            registry.load_file(name.clone(), &config.abi_path(contract))?;
        }
        for chain in config.chains.keys() {
            for rule in config.discovery_rules(chain) {
                registry.check_discovery_event(&rule.source_abi_id, &rule.event_name, &rule.parameter)?;
            }
        }
        tracing::info!(abis = registry.len(), "ABIs loaded");
        Ok(registry)
    }

    /// Fails unless `abi_id` declares `event` with an address-typed `parameter`.
    pub fn check_discovery_event(
        &self,
        abi_id: &str,
        event: &str,
        parameter: &str,
    ) -> Result<(), IndexerError> {
        let found = self.event_by_name(abi_id, event).ok_or_else(|| {
            IndexerError::Config(format!("ABI '{abi_id}' has no event '{event}'"))
        })?;
        let input = found
            .inputs
            .iter()
            .find(|p| p.name == parameter)
            .ok_or_else(|| {
                IndexerError::Config(format!("event '{event}' has no parameter '{parameter}'"))
            })?;
        if input.ty != "address" {
            return Err(IndexerError::Config(format!(
                "parameter '{parameter}' of '{event}' is '{}', expected address",
                input.ty
            )));
        }
        Ok(())
    }

    pub fn event_by_name(&self, abi_id: &str, name: &str) -> Option<&Event> {
        self.abis
            .get(abi_id)?
            .by_selector
            .values()
            .find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.abis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abis.is_empty()
    }
}

impl LogDecoder for AbiRegistry {
    fn decode(&self, log: &RawLog, abi_id: &str) -> Result<DecodedLog, DecodeError> {
        let table = self.abis.get(abi_id).ok_or_else(|| DecodeError::UnknownAbi {
            abi_id: abi_id.to_string(),
        })?;
        let topic0 = log.topic0().ok_or(DecodeError::AnonymousLog)?;
        let event = table
            .by_selector
            .get(topic0)
            .ok_or_else(|| DecodeError::UnknownEvent {
                abi_id: abi_id.to_string(),
                topic0: topic0.to_string(),
            })?;

        let decoded = event
            .decode_log_parts(log.topics.iter().copied(), &log.data, true)
            .map_err(|e| DecodeError::AbiDecodeFailed {
                event: event.name.clone(),
                reason: e.to_string(),
            })?;

        // Re-interleave indexed and body values in declaration order
        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut args = IndexMap::with_capacity(event.inputs.len());
        for (i, input) in event.inputs.iter().enumerate() {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            };
            let Some(value) = value else {
                return Err(DecodeError::AbiDecodeFailed {
                    event: event.name.clone(),
                    reason: format!("missing value for input #{i}"),
                });
            };
            let name = if input.name.is_empty() {
                i.to_string()
            } else {
                input.name.clone()
            };
            args.insert(name, normalizer::normalize(value));
        }

        Ok(DecodedLog {
            event_name: event.name.clone(),
            args,
        })
    }

    fn has_abi(&self, abi_id: &str) -> bool {
        self.abis.contains_key(abi_id)
    }
}

/// Parse ABI JSON: either a plain ABI array or an object with an `abi` field.
pub fn parse_abi_json(json: &str) -> Result<JsonAbi, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    match value {
        serde_json::Value::Object(mut obj) if obj.contains_key("abi") => {
            serde_json::from_value(obj.remove("abi").unwrap_or_default())
        }
        other => serde_json::from_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes, U256};
    use factoryindex_core::types::DecodedValue;

    const FACTORY_ABI: &str = r#"[
      {
        "type": "event",
        "name": "LendingPoolCreated",
        "anonymous": false,
        "inputs": [
          {"name": "collateralToken", "type": "address", "indexed": true},
          {"name": "borrowToken", "type": "address", "indexed": true},
          {"name": "lendingPool", "type": "address", "indexed": true},
          {"name": "ltv", "type": "uint256", "indexed": false}
        ]
      }
    ]"#;

    fn word(address: Address) -> B256 {
        address.into_word()
    }

    fn registry() -> AbiRegistry {
        let mut registry = AbiRegistry::new();
        registry.insert_json("LendingPoolFactory", FACTORY_ABI).unwrap();
        registry
    }

    fn created_log() -> RawLog {
        let abi = parse_abi_json(FACTORY_ABI).unwrap();
        let selector = abi.events().next().unwrap().selector();
        RawLog {
            chain_id: 8453,
            block_number: 100,
            block_hash: B256::ZERO,
            tx_hash: None,
            log_index: 0,
            address: Address::repeat_byte(0xf0),
            topics: vec![
                selector,
                word(Address::repeat_byte(0xaa)),
                word(Address::repeat_byte(0xbb)),
                word(Address::repeat_byte(0xcc)),
            ],
            data: Bytes::from(U256::from(7000u64).to_be_bytes::<32>().to_vec()),
        }
    }

    #[test]
    fn decodes_creation_event_in_declaration_order() {
        let decoded = registry().decode(&created_log(), "LendingPoolFactory").unwrap();
        assert_eq!(decoded.event_name, "LendingPoolCreated");
        let names: Vec<_> = decoded.args.keys().cloned().collect();
        assert_eq!(names, ["collateralToken", "borrowToken", "lendingPool", "ltv"]);
        assert_eq!(
            decoded.args["lendingPool"],
            DecodedValue::Address(Address::repeat_byte(0xcc))
        );
        assert_eq!(decoded.args["ltv"], DecodedValue::Uint(7000));
    }

    #[test]
    fn unknown_selector_and_abi() {
        let registry = registry();
        let mut log = created_log();
        log.topics[0] = B256::repeat_byte(0x01);
        assert!(matches!(
            registry.decode(&log, "LendingPoolFactory"),
            Err(DecodeError::UnknownEvent { .. })
        ));
        assert!(matches!(
            registry.decode(&created_log(), "LendingPool"),
            Err(DecodeError::UnknownAbi { .. })
        ));
        log.topics.clear();
        assert_eq!(
            registry.decode(&log, "LendingPoolFactory"),
            Err(DecodeError::AnonymousLog)
        );
    }

    #[test]
    fn truncated_data_fails() {
        let mut log = created_log();
        log.data = Bytes::from(vec![0u8; 3]);
        assert!(matches!(
            registry().decode(&log, "LendingPoolFactory"),
            Err(DecodeError::AbiDecodeFailed { .. })
        ));
    }

    #[test]
    fn artifact_format_accepted() {
        let artifact = format!(r#"{{"contractName": "LendingPoolFactory", "abi": {FACTORY_ABI}}}"#);
        let mut registry = AbiRegistry::new();
        registry.insert_json("LendingPoolFactory", &artifact).unwrap();
        assert!(registry.has_abi("LendingPoolFactory"));
    }

    #[test]
    fn discovery_event_checks() {
        let registry = registry();
        registry
            .check_discovery_event("LendingPoolFactory", "LendingPoolCreated", "lendingPool")
            .unwrap();
        assert!(registry
            .check_discovery_event("LendingPoolFactory", "LendingPoolCreated", "ltv")
            .is_err());
        assert!(registry
            .check_discovery_event("LendingPoolFactory", "PoolCreated", "pool")
            .is_err());
    }
}
