//! Chain cursor: the last position the indexer fully processed on a chain.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::types::ChainId;

/// The indexer's position on one chain.
///
/// Ordered by `(last_processed_block, last_processed_log_index)`. Only the
/// [`CheckpointManager`](crate::checkpoint::CheckpointManager) mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    pub chain_id: ChainId,
    pub last_processed_block: u64,
    /// Index of the last log seen in that block (`0` when the block had none).
    pub last_processed_log_index: u64,
    /// Hash of `last_processed_block`, used to re-seed reorg detection on restart.
    pub block_hash: Option<B256>,
    /// Unix timestamp of when the cursor was last moved.
    pub updated_at: i64,
}

impl ChainCursor {
    pub fn new(chain_id: ChainId, block: u64, log_index: u64, block_hash: Option<B256>) -> Self {
        Self {
            chain_id,
            last_processed_block: block,
            last_processed_log_index: log_index,
            block_hash,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn position(&self) -> (u64, u64) {
        (self.last_processed_block, self.last_processed_log_index)
    }

    /// Returns `true` if `(block, log_index)` lies strictly after this cursor.
    pub fn is_before(&self, block: u64, log_index: u64) -> bool {
        (block, log_index) > self.position()
    }

    /// Returns the next block to fetch (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.last_processed_block + 1
    }
}
