//! The per-chain index loop: orchestrates backfill, live, and reorg recovery.
//!
//! # Batch cycle
//! 1. Fetch logs of the next range for every registered address, plus
//!    transaction receipts for contracts configured with them.
//! 2. For each block, in order: dispatch → discover → persist new addresses
//!    → checkpoint.
//! 3. While a batch is being processed the next range is prefetched with the
//!    current address set. If the batch registers new addresses the prefetch
//!    is discarded and fetching resumes after the discovery block, so the new
//!    contracts' logs are included.
//!
//! # Phases
//! BACKFILL while the confirmed head is more than one batch ahead, LIVE
//! otherwise. In LIVE the loop polls every `poll_interval_ms`.
//!
//! # Reorgs
//! On [`IndexerError::ChainReorg`] the checkpoint is rewound to the safe
//! ancestor, addresses discovered above it are dropped, reorg handlers run,
//! and indexing resumes at `safe_ancestor + 1`.

use std::collections::BTreeSet;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use tokio::sync::watch;

use factoryindex_core::checkpoint::CheckpointManager;
use factoryindex_core::config::ChainConfig;
use factoryindex_core::discovery::FactoryDiscoveryEngine;
use factoryindex_core::dispatcher::EventDispatcher;
use factoryindex_core::error::IndexerError;
use factoryindex_core::registry::RegistryStore;
use factoryindex_core::reorg::ReorgEvent;
use factoryindex_core::types::{BlockLogs, ChainId, IndexPhase};

use crate::fetcher::ChainLogSource;
use crate::rpc::EvmRpcClient;

/// How a pipeline stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// Reached the configured `to_block`.
    Completed { last_block: Option<u64> },
    /// Shutdown was requested; the cursor is at `last_block`.
    Cancelled { last_block: Option<u64> },
}

/// Summary of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchEnd {
    /// Last block fully processed and checkpointed.
    pub last_block: Option<u64>,
    /// A block of the batch registered new addresses; processing stopped after it.
    pub registry_grew: bool,
    /// Shutdown was observed at a block boundary.
    pub cancelled: bool,
}

enum RangeEnd {
    Done,
    RegistryGrew,
    Cancelled,
}

// ─── BlockProcessor ───────────────────────────────────────────────────────────

/// Everything that happens to a block after it has been fetched.
pub struct BlockProcessor {
    chain_id: ChainId,
    dispatcher: EventDispatcher,
    discovery: FactoryDiscoveryEngine,
    checkpoint: CheckpointManager,
    registry_store: Arc<dyn RegistryStore>,
    /// ABI ids whose events carry transaction receipts.
    receipt_abis: BTreeSet<String>,
}

impl BlockProcessor {
    pub fn new(
        dispatcher: EventDispatcher,
        discovery: FactoryDiscoveryEngine,
        checkpoint: CheckpointManager,
        registry_store: Arc<dyn RegistryStore>,
    ) -> Self {
        Self {
            chain_id: checkpoint.chain_id(),
            dispatcher,
            discovery,
            checkpoint,
            registry_store,
            receipt_abis: BTreeSet::new(),
        }
    }

    /// Fetch transaction receipts for events of these ABIs.
    pub fn with_receipt_abis(mut self, abi_ids: BTreeSet<String>) -> Self {
        self.receipt_abis = abi_ids;
        self
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    pub fn discovery(&self) -> &FactoryDiscoveryEngine {
        &self.discovery
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Every address currently in the registry.
    pub fn watched_addresses(&self) -> Vec<Address> {
        self.discovery
            .reader()
            .entries()
            .into_iter()
            .map(|e| e.address)
            .collect()
    }

    /// Registered addresses whose events carry transaction receipts.
    pub fn receipt_addresses(&self) -> Vec<Address> {
        if self.receipt_abis.is_empty() {
            return Vec::new();
        }
        self.discovery
            .reader()
            .entries()
            .into_iter()
            .filter(|e| self.receipt_abis.contains(&e.abi_id))
            .map(|e| e.address)
            .collect()
    }

    pub fn last_block(&self) -> Option<u64> {
        self.checkpoint
            .current_cursor()
            .map(|c| c.last_processed_block)
    }

    /// Persist registry entries not yet written to the store.
    pub async fn flush_registry(&mut self) -> Result<usize, IndexerError> {
        let pending = self.discovery.registry_mut().take_pending();
        if !pending.is_empty() {
            self.registry_store.save_addresses(&pending).await?;
        }
        Ok(pending.len())
    }

    /// Process `blocks` in order.
    ///
    /// Stops early after a block that registered new addresses, or at a block
    /// boundary once `shutdown` is set. Blocks that touched no registered
    /// contract are only checkpointed when they end the batch.
    pub async fn process_batch(
        &mut self,
        blocks: &[BlockLogs],
        phase: IndexPhase,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchEnd, IndexerError> {
        let mut end = BatchEnd::default();
        let mut unsaved: Option<&BlockLogs> = None;

        for (i, block) in blocks.iter().enumerate() {
            if *shutdown.borrow() {
                end.cancelled = true;
                break;
            }

            let outcome = self.dispatcher.dispatch_block(block, phase).await?;
            let report = self.discovery.process_block(&outcome.events);
            self.flush_registry().await?;

            let grew = !report.registered.is_empty();
            let is_last = i + 1 == blocks.len();
            if outcome.touched_registry() || grew || is_last {
                self.commit(block).await?;
                unsaved = None;
            } else {
                unsaved = Some(block);
            }
            self.dispatcher.finish();
            end.last_block = Some(block.number);

            if grew {
                end.registry_grew = true;
                tracing::info!(
                    chain_id = self.chain_id,
                    block = block.number,
                    new_addresses = report.registered.len(),
                    watched = self.discovery.reader().len(),
                    "Registry grew, refetching with the new address set"
                );
                break;
            }
        }

        if let Some(block) = unsaved {
            self.commit(block).await?;
            self.dispatcher.finish();
        }
        Ok(end)
    }

    async fn commit(&mut self, block: &BlockLogs) -> Result<(), IndexerError> {
        self.dispatcher.begin_checkpoint(block.number);
        self.checkpoint
            .advance(block.number, block.last_log_index(), block.hash)
            .await?;
        Ok(())
    }

    /// Undo everything derived from blocks above `reorg.safe_ancestor`.
    pub async fn rollback(
        &mut self,
        reorg: &ReorgEvent,
        safe_hash: Option<B256>,
        phase: IndexPhase,
    ) -> Result<(), IndexerError> {
        let safe = reorg.safe_ancestor;
        self.checkpoint.rollback_to(safe, safe_hash).await?;

        let removed = self.discovery.registry_mut().rollback_after(safe);
        let deleted = self
            .registry_store
            .delete_discovered_after(self.chain_id, safe)
            .await?;
        if !removed.is_empty() || deleted > 0 {
            tracing::warn!(
                chain_id = self.chain_id,
                safe_ancestor = safe,
                removed = removed.len(),
                deleted,
                "Discovered addresses rolled back"
            );
        }

        let anchor = BlockLogs::new(safe, safe_hash, Vec::new());
        let ctx = self.dispatcher.context(&anchor, phase);
        self.dispatcher.handlers().dispatch_reorg(reorg, &ctx).await?;
        self.dispatcher.finish();
        Ok(())
    }
}

// ─── ChainPipeline ────────────────────────────────────────────────────────────

/// Indexes one chain from its checkpoint until `to_block` or shutdown.
pub struct ChainPipeline<C: EvmRpcClient> {
    chain: String,
    config: ChainConfig,
    source: ChainLogSource<C>,
    processor: BlockProcessor,
    phase: Option<IndexPhase>,
}

impl<C: EvmRpcClient> ChainPipeline<C> {
    pub fn new(
        chain: impl Into<String>,
        config: ChainConfig,
        source: ChainLogSource<C>,
        processor: BlockProcessor,
    ) -> Self {
        Self {
            chain: chain.into(),
            config,
            source,
            processor,
            phase: None,
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn chain_id(&self) -> ChainId {
        self.config.id
    }

    pub fn processor(&self) -> &BlockProcessor {
        &self.processor
    }

    pub fn source(&self) -> &ChainLogSource<C> {
        &self.source
    }

    /// Run until `to_block` is reached, `shutdown` is set, or a fatal error.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineExit, IndexerError> {
        let chain_id = self.config.id;
        tracing::info!(
            chain = %self.chain,
            chain_id,
            from = self.processor.checkpoint().resume_block(),
            to = ?self.config.to_block,
            watched = self.processor.discovery().reader().len(),
            "Starting chain pipeline"
        );

        loop {
            if *shutdown.borrow() {
                return Ok(self.cancelled());
            }

            let next = self.processor.checkpoint().resume_block();
            if self.config.to_block.is_some_and(|to| next > to) {
                let last_block = self.processor.last_block();
                tracing::info!(chain = %self.chain, ?last_block, "Reached to_block");
                return Ok(PipelineExit::Completed { last_block });
            }

            let head = self.source.head_block_number().await?;
            let mut target = head.saturating_sub(self.config.confirmation_depth);
            if let Some(to) = self.config.to_block {
                target = target.min(to);
            }

            if next > target {
                self.set_phase(IndexPhase::Live);
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(self.cancelled());
                        }
                    }
                }
                continue;
            }

            let phase = if target - next >= self.config.batch_size {
                IndexPhase::Backfill
            } else {
                IndexPhase::Live
            };
            self.set_phase(phase);

            match self.run_range(next, target, head, phase, &shutdown).await {
                Ok(RangeEnd::Cancelled) => return Ok(self.cancelled()),
                Ok(RangeEnd::Done | RangeEnd::RegistryGrew) => {}
                Err(IndexerError::ChainReorg(reorg)) => {
                    let safe_hash = self.source.tracked_hash(reorg.safe_ancestor);
                    self.processor.rollback(&reorg, safe_hash, phase).await?;
                    tracing::info!(
                        chain = %self.chain,
                        resume = self.processor.checkpoint().resume_block(),
                        "Resuming after reorg"
                    );
                }
                Err(e) => {
                    tracing::error!(chain = %self.chain, error = %e, "Chain pipeline failed");
                    return Err(e);
                }
            }
        }
    }

    /// Process `[from, target]` batch by batch, prefetching the next batch
    /// while the current one is dispatched.
    async fn run_range(
        &mut self,
        from: u64,
        target: u64,
        head: u64,
        phase: IndexPhase,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<RangeEnd, IndexerError> {
        let addresses = self.processor.watched_addresses();
        let receipts_for = self.processor.receipt_addresses();
        let batch_size = self.config.batch_size.max(1);
        let batch_end = |start: u64| start.saturating_add(batch_size - 1).min(target);

        self.processor.dispatcher.begin_fetch(from);
        let mut blocks = self
            .source
            .fetch_blocks(from, batch_end(from), head, &addresses, &receipts_for)
            .await?;

        loop {
            let Some(last) = blocks.last().map(|b| b.number) else {
                return Ok(RangeEnd::Done);
            };
            let next_start = last + 1;

            let (prefetched, end) = if next_start <= target {
                let (fetched, processed) = tokio::join!(
                    self.source.fetch_blocks(
                        next_start,
                        batch_end(next_start),
                        head,
                        &addresses,
                        &receipts_for,
                    ),
                    self.processor.process_batch(&blocks, phase, shutdown),
                );
                (Some(fetched), processed?)
            } else {
                (None, self.processor.process_batch(&blocks, phase, shutdown).await?)
            };

            if phase == IndexPhase::Backfill {
                if let Some(block) = end.last_block {
                    tracing::info!(
                        chain = %self.chain,
                        block,
                        target,
                        "Backfill batch complete"
                    );
                }
            }

            // A reorg seen by the prefetch invalidates what was just processed
            let prefetched = match prefetched {
                Some(Err(e)) if e.is_reorg() => return Err(e),
                other => other,
            };

            if end.cancelled {
                return Ok(RangeEnd::Cancelled);
            }
            if end.registry_grew {
                // Headers of the discarded prefetch must be verified again
                if let Some(block) = end.last_block {
                    self.source.rewind_to(block);
                }
                return Ok(RangeEnd::RegistryGrew);
            }

            match prefetched {
                Some(fetched) => {
                    self.processor.dispatcher.begin_fetch(next_start);
                    blocks = fetched?;
                }
                None => return Ok(RangeEnd::Done),
            }
        }
    }

    fn set_phase(&mut self, phase: IndexPhase) {
        if self.phase != Some(phase) {
            tracing::info!(chain = %self.chain, %phase, "Indexing phase");
            self.phase = Some(phase);
        }
    }

    fn cancelled(&self) -> PipelineExit {
        let last_block = self.processor.last_block();
        tracing::info!(chain = %self.chain, ?last_block, "Chain pipeline stopped");
        PipelineExit::Cancelled { last_block }
    }
}
