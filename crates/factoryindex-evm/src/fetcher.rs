//! Chain log source: range-batched log fetching with header verification.
//!
//! Wraps an [`EvmRpcClient`] and adds:
//!
//! - splitting of `eth_getLogs` ranges into `max_log_range` chunks
//! - retry with exponential backoff for transient failures
//! - grouping of logs into one [`BlockLogs`] per block, ascending by log index
//! - parent-hash verification of blocks near the head, raising
//!   [`IndexerError::ChainReorg`] once the fork point is located
//! - transaction receipts for logs of contracts that request them

use std::collections::{BTreeMap, BTreeSet};

use alloy_primitives::{Address, B256};

use factoryindex_core::error::IndexerError;
use factoryindex_core::reorg::{HeaderCheck, ReorgDetector, ReorgEvent};
use factoryindex_core::retry::RetryPolicy;
use factoryindex_core::types::{BlockLogs, BlockSummary, ChainId, RawLog, TransactionReceipt};

use crate::rpc::EvmRpcClient;

/// Fetches ordered, verified logs of one chain.
pub struct ChainLogSource<C> {
    client: C,
    chain_id: ChainId,
    max_log_range: u64,
    reorg_window: u64,
    retry: RetryPolicy,
    detector: ReorgDetector,
}

impl<C: EvmRpcClient> ChainLogSource<C> {
    pub fn new(
        client: C,
        chain_id: ChainId,
        max_log_range: u64,
        reorg_window: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            chain_id,
            max_log_range: max_log_range.max(1),
            reorg_window: reorg_window as u64,
            retry,
            detector: ReorgDetector::new(chain_id, reorg_window),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn detector(&self) -> &ReorgDetector {
        &self.detector
    }

    /// Seed header verification with the last checkpointed block.
    pub fn seed(&mut self, number: u64, hash: B256) {
        self.detector.seed(number, hash);
    }

    /// Forget tracked headers above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        self.detector.rewind_to(block_number);
    }

    /// Hash of a tracked block, if it is still in the window.
    pub fn tracked_hash(&self, block_number: u64) -> Option<B256> {
        self.detector.tracker().hash_of(block_number)
    }

    /// Fetch the current chain head block number.
    pub async fn head_block_number(&self) -> Result<u64, IndexerError> {
        let client = &self.client;
        self.retry
            .run("eth_blockNumber", || client.block_number())
            .await
    }

    /// Fetch the header of `number`. A node that does not have it yet is
    /// treated as a transient failure.
    pub async fn header(&self, number: u64) -> Result<BlockSummary, IndexerError> {
        let client = &self.client;
        self.retry
            .run("eth_getBlockByNumber", || async move {
                client.block(number).await?.ok_or_else(|| {
                    IndexerError::transient(format!("block {number} not available yet"))
                })
            })
            .await
    }

    /// Fetch the receipt of `tx_hash`. A node that does not have it yet is
    /// treated as a transient failure.
    pub async fn receipt(&self, tx_hash: B256) -> Result<TransactionReceipt, IndexerError> {
        let client = &self.client;
        let receipt = self
            .retry
            .run("eth_getTransactionReceipt", || async move {
                client.transaction_receipt(tx_hash).await?.ok_or_else(|| {
                    IndexerError::transient(format!("receipt of {tx_hash} not available yet"))
                })
            })
            .await?;
        Ok(receipt.into())
    }

    /// Fetch all logs in `[from, to]` emitted by `addresses`, sorted by
    /// `(block_number, log_index)`.
    ///
    /// Ranges wider than `max_log_range` are split. Logs flagged `removed`
    /// are dropped. No request is made for an empty address set.
    pub async fn fetch_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<RawLog>, IndexerError> {
        if to < from || addresses.is_empty() {
            return Ok(vec![]);
        }

        let client = &self.client;
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.max_log_range - 1).min(to);
            let chunk = self
                .retry
                .run("eth_getLogs", || client.logs(start, end, addresses))
                .await?;
            for log in chunk {
                if log.is_removed() {
                    continue;
                }
                all_logs.push(log.into_raw(self.chain_id)?);
            }
            start = end + 1;
        }

        all_logs.sort_by_key(RawLog::position);
        all_logs.dedup_by_key(|l| l.position());
        tracing::debug!(
            chain_id = self.chain_id,
            from,
            to,
            logs = all_logs.len(),
            "Fetched logs"
        );
        Ok(all_logs)
    }

    /// Fetch `[from, to]` as one [`BlockLogs`] per block.
    ///
    /// Blocks within `reorg_window` of `head` are verified against their
    /// headers. A parent-hash mismatch is resolved to a fork point and
    /// returned as [`IndexerError::ChainReorg`]. Logs whose block hash
    /// disagrees with the header are refetched.
    ///
    /// Logs emitted by `receipts_for` get the receipt of their transaction,
    /// fetched once per transaction.
    pub async fn fetch_blocks(
        &mut self,
        from: u64,
        to: u64,
        head: u64,
        addresses: &[Address],
        receipts_for: &[Address],
    ) -> Result<Vec<BlockLogs>, IndexerError> {
        let verify_from = head.saturating_sub(self.reorg_window);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .fetch_verified(from, to, verify_from, addresses, receipts_for)
                .await?
            {
                Some(blocks) => return Ok(blocks),
                None => {
                    self.detector.rewind_to(from.saturating_sub(1));
                    let Some(delay) = self.retry.next_delay(attempt) else {
                        return Err(IndexerError::RetriesExhausted {
                            attempts: attempt,
                            reason: format!("logs of blocks {from}..={to} kept changing under the header"),
                        });
                    };
                    tracing::warn!(
                        chain_id = self.chain_id,
                        from,
                        to,
                        attempt,
                        "Log block hash disagrees with header, refetching"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One pass of [`fetch_blocks`](Self::fetch_blocks). `None` means the
    /// logs, headers, or receipts came from different forks.
    async fn fetch_verified(
        &mut self,
        from: u64,
        to: u64,
        verify_from: u64,
        addresses: &[Address],
        receipts_for: &[Address],
    ) -> Result<Option<Vec<BlockLogs>>, IndexerError> {
        let mut by_block: BTreeMap<u64, Vec<RawLog>> = BTreeMap::new();
        for log in self.fetch_logs(from, to, addresses).await? {
            by_block.entry(log.block_number).or_default().push(log);
        }

        let mut blocks = Vec::with_capacity((to - from + 1) as usize);
        for number in from..=to {
            let logs = by_block.remove(&number).unwrap_or_default();
            let mut hash = logs.first().map(|l| l.block_hash);

            if number >= verify_from {
                let header = self.header(number).await?;
                if hash.is_some_and(|h| h != header.hash) {
                    return Ok(None);
                }
                hash = Some(header.hash);
                if let HeaderCheck::Mismatch { at } = self.detector.observe(header) {
                    let reorg = self.find_fork(at).await?;
                    return Err(IndexerError::ChainReorg(Box::new(reorg)));
                }
            }

            let mut block = BlockLogs::new(number, hash, logs);
            if !self.attach_receipts(&mut block, receipts_for).await? {
                return Ok(None);
            }
            blocks.push(block);
        }
        Ok(Some(blocks))
    }

    /// Fetch receipts for the logs of `block` emitted by `receipts_for`.
    /// Returns `false` if a receipt belongs to a different block hash.
    async fn attach_receipts(
        &self,
        block: &mut BlockLogs,
        receipts_for: &[Address],
    ) -> Result<bool, IndexerError> {
        let wanted: BTreeSet<(B256, B256)> = block
            .logs
            .iter()
            .filter(|log| receipts_for.contains(&log.address))
            .filter_map(|log| log.tx_hash.map(|tx| (tx, log.block_hash)))
            .collect();

        for (tx_hash, block_hash) in wanted {
            let receipt = self.receipt(tx_hash).await?;
            if receipt.block_hash != block_hash {
                return Ok(false);
            }
            block.receipts.insert(tx_hash, receipt);
        }
        Ok(true)
    }

    /// Walk tracked headers newest-first until one still matches the
    /// canonical chain.
    async fn find_fork(&mut self, detected_at: u64) -> Result<ReorgEvent, IndexerError> {
        for (number, tracked) in self.detector.candidates() {
            let canonical = self.header(number).await?;
            if canonical.hash == tracked {
                return Ok(self.detector.resolve(number, detected_at));
            }
        }

        let safe = self
            .detector
            .oldest_tracked()
            .unwrap_or(detected_at)
            .saturating_sub(1);
        tracing::warn!(
            chain_id = self.chain_id,
            detected_at,
            safe_ancestor = safe,
            "Reorg deeper than the tracked window"
        );
        Ok(self.detector.resolve(safe, detected_at))
    }
}
