//! Event dispatcher: filters, decodes, and routes one block of logs at a time.
//!
//! ```text
//! Idle ─begin_fetch─► Fetching ─dispatch_block─► Dispatching ─► Checkpointing ─finish─► Idle
//! ```
//!
//! Logs from addresses not visible in the registry at the block's height are
//! dropped silently. Decode failures are recorded and skipped, except for
//! factories and any contract a discovery rule reads from: losing one of
//! their logs would lose discovery data.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use alloy_primitives::Address;

use crate::decoder::LogDecoder;
use crate::error::{DecodeError, IndexerError};
use crate::handler::HandlerRegistry;
use crate::registry::RegistryReader;
use crate::types::{BlockLogs, ChainId, DecodedEvent, IndexContext, IndexPhase, WatchedAddress};

/// Lifecycle state of a chain's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Fetching { from_block: u64 },
    Dispatching { block: u64 },
    Checkpointing { block: u64 },
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Fetching { from_block } => write!(f, "fetching from {from_block}"),
            Self::Dispatching { block } => write!(f, "dispatching {block}"),
            Self::Checkpointing { block } => write!(f, "checkpointing {block}"),
        }
    }
}

/// A log that matched a registered address but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLog {
    pub address: Address,
    pub log_index: u64,
    pub error: DecodeError,
}

/// Result of dispatching one block.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub block_number: u64,
    /// Decoded events in log-index order.
    pub events: Vec<DecodedEvent>,
    /// Logs from addresses not registered (or not yet visible) at this height.
    pub dropped: usize,
    pub skipped: Vec<SkippedLog>,
}

impl DispatchOutcome {
    /// Returns `true` if at least one log belonged to a registered contract.
    pub fn touched_registry(&self) -> bool {
        !self.events.is_empty() || !self.skipped.is_empty()
    }
}

/// Routes logs of one chain to handlers.
pub struct EventDispatcher {
    chain_id: ChainId,
    chain: String,
    registry: RegistryReader,
    decoder: Arc<dyn LogDecoder>,
    handlers: Arc<HandlerRegistry>,
    /// ABI ids whose events feed discovery rules.
    discovery_sources: BTreeSet<String>,
    state: DispatcherState,
}

impl EventDispatcher {
    pub fn new(
        chain_id: ChainId,
        chain: impl Into<String>,
        registry: RegistryReader,
        decoder: Arc<dyn LogDecoder>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            chain_id,
            chain: chain.into(),
            registry,
            decoder,
            handlers,
            discovery_sources: BTreeSet::new(),
            state: DispatcherState::Idle,
        }
    }

    /// Treat decode failures of these ABIs as fatal, like factory logs.
    pub fn with_discovery_sources<I, S>(mut self, abi_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discovery_sources.extend(abi_ids.into_iter().map(Into::into));
        self
    }

    /// Returns `true` if an undecodable log of `entry` would lose discovery data.
    pub fn is_discovery_critical(&self, entry: &WatchedAddress) -> bool {
        entry.role.is_discovery_critical() || self.discovery_sources.contains(&entry.abi_id)
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Handler context for `block`.
    pub fn context(&self, block: &BlockLogs, phase: IndexPhase) -> IndexContext {
        IndexContext {
            chain_id: self.chain_id,
            chain: self.chain.clone(),
            block_number: block.number,
            block_hash: block.hash,
            phase,
        }
    }

    /// Record that a range fetch starting at `from_block` is in flight.
    pub fn begin_fetch(&mut self, from_block: u64) {
        self.state = DispatcherState::Fetching { from_block };
    }

    /// Filter, decode, and route every log of `block`, in log-index order.
    ///
    /// Handler errors and critical decode failures abort the block; the
    /// caller must not checkpoint it.
    pub async fn dispatch_block(
        &mut self,
        block: &BlockLogs,
        phase: IndexPhase,
    ) -> Result<DispatchOutcome, IndexerError> {
        self.state = DispatcherState::Dispatching {
            block: block.number,
        };
        let ctx = self.context(block, phase);
        let mut outcome = DispatchOutcome {
            block_number: block.number,
            ..Default::default()
        };

        for log in &block.logs {
            let Some(entry) = self.registry.lookup_at(&log.address, block.number) else {
                outcome.dropped += 1;
                continue;
            };

            let decoded = match self.decoder.decode(log, &entry.abi_id) {
                Ok(decoded) => decoded,
                Err(source) if self.is_discovery_critical(&entry) => {
                    tracing::error!(
                        chain_id = self.chain_id,
                        block = block.number,
                        log_index = log.log_index,
                        address = %log.address,
                        error = %source,
                        "Failed to decode discovery-critical log"
                    );
                    return Err(IndexerError::CriticalDecode {
                        address: log.address,
                        block_number: block.number,
                        source,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        chain_id = self.chain_id,
                        block = block.number,
                        log_index = log.log_index,
                        address = %log.address,
                        %error,
                        "Skipping undecodable log"
                    );
                    outcome.skipped.push(SkippedLog {
                        address: log.address,
                        log_index: log.log_index,
                        error,
                    });
                    continue;
                }
            };

            let event = DecodedEvent {
                event_name: decoded.event_name,
                args: decoded.args,
                source_log: log.clone(),
                role: entry.role,
                abi_id: entry.abi_id,
                receipt: block.receipt_for(log).cloned(),
            };
            self.handlers.dispatch_event(&event, &ctx).await?;
            outcome.events.push(event);
        }

        if outcome.touched_registry() {
            self.handlers.dispatch_block(block, &ctx).await?;
            tracing::debug!(
                chain_id = self.chain_id,
                block = block.number,
                events = outcome.events.len(),
                dropped = outcome.dropped,
                skipped = outcome.skipped.len(),
                "Block dispatched"
            );
        }
        Ok(outcome)
    }

    /// Record that `block` is being checkpointed.
    pub fn begin_checkpoint(&mut self, block: u64) {
        self.state = DispatcherState::Checkpointing { block };
    }

    /// Return to `Idle` after a checkpoint (or a reorg rollback).
    pub fn finish(&mut self) {
        self.state = DispatcherState::Idle;
    }
}
