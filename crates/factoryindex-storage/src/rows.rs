//! Row types shared by the SQL backends.
//!
//! Both backends store numbers as `BIGINT`/`INTEGER` (`i64`) and addresses
//! and hashes as `0x`-prefixed text.

use std::fmt::Display;
use std::str::FromStr;

use alloy_primitives::{Address, B256};

use factoryindex_core::checkpoint::VersionedCursor;
use factoryindex_core::cursor::ChainCursor;
use factoryindex_core::error::IndexerError;
use factoryindex_core::types::{AddressSource, ContractRole, WatchedAddress};

use crate::StoredEvent;

pub(crate) fn storage_err(e: impl Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

fn parse<T>(column: &str, value: &str) -> Result<T, IndexerError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| IndexerError::Storage(format!("invalid {column} '{value}': {e}")))
}

fn parse_opt<T>(column: &str, value: Option<&str>) -> Result<Option<T>, IndexerError>
where
    T: FromStr,
    T::Err: Display,
{
    value.map(|v| parse(column, v)).transpose()
}

pub(crate) fn receipt_json(event: &StoredEvent) -> Result<Option<serde_json::Value>, IndexerError> {
    event
        .receipt
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(storage_err)
}

// ─── Checkpoints ──────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
pub(crate) struct CheckpointRow {
    pub chain_id: i64,
    pub last_processed_block: i64,
    pub last_processed_log_index: i64,
    pub block_hash: Option<String>,
    pub updated_at: i64,
    pub version: i64,
}

impl CheckpointRow {
    pub fn into_versioned(self) -> Result<VersionedCursor, IndexerError> {
        Ok(VersionedCursor {
            cursor: ChainCursor {
                chain_id: self.chain_id as u64,
                last_processed_block: self.last_processed_block as u64,
                last_processed_log_index: self.last_processed_log_index as u64,
                block_hash: parse_opt::<B256>("block_hash", self.block_hash.as_deref())?,
                updated_at: self.updated_at,
            },
            version: self.version as u64,
        })
    }
}

// ─── Watched addresses ────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
pub(crate) struct AddressRow {
    pub chain_id: i64,
    pub address: String,
    pub role: String,
    pub abi_id: String,
    pub discovered_at_block: i64,
    pub source: String,
    pub factory: Option<String>,
    pub tx_hash: Option<String>,
}

impl AddressRow {
    pub fn from_entry(entry: &WatchedAddress) -> Self {
        let (source, factory, tx_hash) = match &entry.source {
            AddressSource::Static => ("static", None, None),
            AddressSource::Discovered { factory, tx_hash } => (
                "discovered",
                Some(factory.to_string()),
                tx_hash.map(|h| h.to_string()),
            ),
        };
        Self {
            chain_id: entry.chain_id as i64,
            address: entry.address.to_string(),
            role: entry.role.as_str().to_string(),
            abi_id: entry.abi_id.clone(),
            discovered_at_block: entry.discovered_at_block as i64,
            source: source.to_string(),
            factory,
            tx_hash,
        }
    }

    pub fn into_entry(self) -> Result<WatchedAddress, IndexerError> {
        let source = match self.source.as_str() {
            "static" => AddressSource::Static,
            "discovered" => AddressSource::Discovered {
                factory: parse::<Address>("factory", self.factory.as_deref().unwrap_or_default())?,
                tx_hash: parse_opt::<B256>("tx_hash", self.tx_hash.as_deref())?,
            },
            other => return Err(IndexerError::Storage(format!("invalid address source '{other}'"))),
        };
        Ok(WatchedAddress {
            chain_id: self.chain_id as u64,
            address: parse("address", &self.address)?,
            role: parse::<ContractRole>("role", &self.role)?,
            abi_id: self.abi_id,
            discovered_at_block: self.discovered_at_block as u64,
            source,
        })
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
pub(crate) struct EventRow {
    pub chain_id: i64,
    pub block_number: i64,
    pub log_index: i64,
    pub block_hash: String,
    pub tx_hash: Option<String>,
    pub address: String,
    pub role: String,
    pub abi_id: String,
    pub event_name: String,
    pub args: serde_json::Value,
    pub receipt: Option<serde_json::Value>,
}

impl EventRow {
    pub fn into_event(self) -> Result<StoredEvent, IndexerError> {
        Ok(StoredEvent {
            chain_id: self.chain_id as u64,
            block_number: self.block_number as u64,
            log_index: self.log_index as u64,
            block_hash: parse("block_hash", &self.block_hash)?,
            tx_hash: parse_opt("tx_hash", self.tx_hash.as_deref())?,
            address: parse("address", &self.address)?,
            role: parse("role", &self.role)?,
            abi_id: self.abi_id,
            event_name: self.event_name,
            args: self.args,
            receipt: self
                .receipt
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| IndexerError::Storage(format!("invalid receipt: {e}")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factoryindex_core::types::TransactionReceipt;

    #[test]
    fn address_row_roundtrip() {
        let entry = WatchedAddress {
            chain_id: 8453,
            address: Address::repeat_byte(0xcc),
            role: ContractRole::Pool,
            abi_id: "LendingPool".into(),
            discovered_at_block: 100,
            source: AddressSource::Discovered {
                factory: Address::repeat_byte(0xf0),
                tx_hash: Some(B256::repeat_byte(0x11)),
            },
        };
        let row = AddressRow::from_entry(&entry);
        assert_eq!(row.source, "discovered");
        assert_eq!(row.into_entry().unwrap(), entry);
    }

    #[test]
    fn malformed_receipt_is_a_storage_error() {
        let row = EventRow {
            chain_id: 8453,
            block_number: 100,
            log_index: 0,
            block_hash: B256::repeat_byte(0xaa).to_string(),
            tx_hash: None,
            address: Address::repeat_byte(0xcc).to_string(),
            role: "pool".into(),
            abi_id: "LendingPool".into(),
            event_name: "SupplyLiquidity".into(),
            args: serde_json::json!({}),
            receipt: Some(serde_json::json!({"status": "maybe"})),
        };
        assert!(matches!(row.into_event(), Err(IndexerError::Storage(_))));
    }

    #[test]
    fn receipt_survives_json_column() {
        let receipt = TransactionReceipt {
            transaction_hash: B256::repeat_byte(0x11),
            block_hash: B256::repeat_byte(0xaa),
            block_number: 100,
            from: Address::repeat_byte(0x01),
            to: Some(Address::repeat_byte(0xcc)),
            contract_address: None,
            status: false,
            gas_used: 84_211,
            effective_gas_price: Some(1_000_000_007),
        };
        let event = StoredEvent {
            chain_id: 8453,
            block_number: 100,
            log_index: 0,
            block_hash: receipt.block_hash,
            tx_hash: Some(receipt.transaction_hash),
            address: Address::repeat_byte(0xcc),
            role: ContractRole::Pool,
            abi_id: "LendingPool".into(),
            event_name: "SupplyLiquidity".into(),
            args: serde_json::json!({}),
            receipt: Some(receipt.clone()),
        };
        let row = EventRow {
            chain_id: 8453,
            block_number: 100,
            log_index: 0,
            block_hash: event.block_hash.to_string(),
            tx_hash: event.tx_hash.map(|h| h.to_string()),
            address: event.address.to_string(),
            role: "pool".into(),
            abi_id: event.abi_id.clone(),
            event_name: event.event_name.clone(),
            args: event.args.clone(),
            receipt: receipt_json(&event).unwrap(),
        };
        assert_eq!(row.into_event().unwrap().receipt, Some(receipt));
    }

    #[test]
    fn bad_source_is_a_storage_error() {
        let mut row = AddressRow::from_entry(&WatchedAddress {
            chain_id: 1,
            address: Address::repeat_byte(1),
            role: ContractRole::Factory,
            abi_id: "F".into(),
            discovered_at_block: 0,
            source: AddressSource::Static,
        });
        row.source = "imported".into();
        assert!(matches!(row.into_entry(), Err(IndexerError::Storage(_))));
    }
}
