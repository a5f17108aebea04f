//! Factory discovery: grows the address registry from on-chain creation events.
//!
//! A [`DiscoveryRule`] says: when a contract decoded with `source_abi_id` emits
//! `event_name`, the address in `parameter` is a new contract with
//! `child_role`, decoded with `child_abi_id`. The same mechanism covers pool
//! creation by a factory, router creation, and position creation by a router.
//!
//! Malformed creation events are logged and skipped; they never halt the stream.

use std::collections::BTreeSet;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, IndexerError};
use crate::registry::{AddressRegistry, Registration, RegistryReader};
use crate::types::{AddressSource, ContractRole, DecodedEvent, WatchedAddress};

/// Declarative description of one creation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRule {
    /// ABI id of the emitting contract (e.g. `"LendingPoolFactory"`).
    pub source_abi_id: String,
    /// Creation event name (e.g. `"LendingPoolCreated"`).
    pub event_name: String,
    /// Address-bearing parameter (e.g. `"lendingPool"`).
    pub parameter: String,
    pub child_role: ContractRole,
    /// ABI id for the created contract (e.g. `"LendingPool"`).
    pub child_abi_id: String,
}

impl DiscoveryRule {
    pub fn matches(&self, event: &DecodedEvent) -> bool {
        event.abi_id == self.source_abi_id && event.event_name == self.event_name
    }

    /// Pull the created contract's address out of `event`.
    pub fn extract(&self, event: &DecodedEvent) -> Result<Address, DecodeError> {
        let value = event
            .arg(&self.parameter)
            .ok_or_else(|| DecodeError::MissingParameter {
                event: event.event_name.clone(),
                parameter: self.parameter.clone(),
            })?;
        let address = value.as_address().ok_or_else(|| DecodeError::NotAnAddress {
            event: event.event_name.clone(),
            parameter: self.parameter.clone(),
        })?;
        if address == Address::ZERO {
            return Err(DecodeError::ZeroAddress {
                event: event.event_name.clone(),
                parameter: self.parameter.clone(),
            });
        }
        Ok(address)
    }
}

/// A creation event that could not be turned into a registration.
#[derive(Debug)]
pub struct DiscoveryFailure {
    pub block_number: u64,
    pub log_index: u64,
    /// Contract that emitted the creation event.
    pub emitter: Address,
    pub error: IndexerError,
}

/// Outcome of running discovery over one block's events.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub registered: Vec<WatchedAddress>,
    pub duplicates: usize,
    pub failures: Vec<DiscoveryFailure>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.duplicates == 0 && self.failures.is_empty()
    }
}

/// Owns the registry writer and applies discovery rules to decoded events.
pub struct FactoryDiscoveryEngine {
    registry: AddressRegistry,
    rules: Vec<DiscoveryRule>,
}

impl FactoryDiscoveryEngine {
    pub fn new(registry: AddressRegistry, rules: Vec<DiscoveryRule>) -> Self {
        Self { registry, rules }
    }

    pub fn rules(&self) -> &[DiscoveryRule] {
        &self.rules
    }

    pub fn reader(&self) -> RegistryReader {
        self.registry.reader()
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AddressRegistry {
        &mut self.registry
    }

    /// Apply every matching rule to a single event.
    ///
    /// Returns the newly registered entries (empty for duplicates or
    /// non-creation events), or the first failure among the matching rules.
    pub fn observe(&mut self, event: &DecodedEvent) -> Result<Vec<WatchedAddress>, IndexerError> {
        let mut report = DiscoveryReport::default();
        self.discover(event, &mut report);
        match report.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(report.registered),
        }
    }

    /// Run discovery over one block's decoded events, in order.
    ///
    /// Failures are logged and collected; they do not stop the remaining events.
    pub fn process_block(&mut self, events: &[DecodedEvent]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        for event in events {
            self.discover(event, &mut report);
        }
        report
    }

    fn discover(&mut self, event: &DecodedEvent, report: &mut DiscoveryReport) {
        for idx in 0..self.rules.len() {
            if !self.rules[idx].matches(event) {
                continue;
            }
            match self.apply(idx, event) {
                Ok(Registration::Inserted(entry)) => {
                    tracing::info!(
                        chain_id = entry.chain_id,
                        address = %entry.address,
                        role = %entry.role,
                        block = entry.discovered_at_block,
                        event = %event.event_name,
                        "Discovered contract"
                    );
                    report.registered.push(entry);
                }
                Ok(Registration::AlreadyRegistered) => {
                    tracing::debug!(
                        block = event.block_number(),
                        event = %event.event_name,
                        "Duplicate creation event ignored"
                    );
                    report.duplicates += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        block = event.block_number(),
                        log_index = event.source_log.log_index,
                        emitter = %event.source_log.address,
                        %error,
                        "Skipping malformed creation event"
                    );
                    report.failures.push(DiscoveryFailure {
                        block_number: event.block_number(),
                        log_index: event.source_log.log_index,
                        emitter: event.source_log.address,
                        error,
                    });
                }
            }
        }
    }

    /// ABI ids whose events feed at least one rule.
    pub fn source_abis(&self) -> BTreeSet<String> {
        self.rules.iter().map(|r| r.source_abi_id.clone()).collect()
    }

    fn apply(&mut self, idx: usize, event: &DecodedEvent) -> Result<Registration, IndexerError> {
        let rule = &self.rules[idx];
        let address = rule.extract(event)?;
        let role = rule.child_role;
        let abi_id = rule.child_abi_id.clone();
        self.registry.register_discovered(
            address,
            role,
            abi_id,
            event.block_number(),
            event.source_log.address,
            event.source_log.tx_hash,
        )
    }
}

/// Returns `true` if `entry` was produced by `factory`.
pub fn discovered_by(entry: &WatchedAddress, factory: &Address) -> bool {
    matches!(&entry.source, AddressSource::Discovered { factory: f, .. } if f == factory)
}
