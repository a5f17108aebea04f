//! Window of recently processed block headers.
//!
//! Every processed block is recorded here and the next header must name the
//! newest entry as its parent. On a mismatch the window supplies the hashes
//! compared against the node while searching for the common ancestor.

use std::collections::VecDeque;

use alloy_primitives::B256;

use crate::types::BlockSummary;

/// Bounded window of processed headers, oldest first.
pub struct BlockTracker {
    headers: VecDeque<BlockSummary>,
    capacity: usize,
}

impl BlockTracker {
    /// `capacity` bounds how deep a fork can be resolved from memory; a
    /// deeper one rewinds to the oldest tracked block.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            headers: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `header`. A header that skips ahead of the newest entry starts
    /// a fresh window.
    ///
    /// A header at the next height that does not link to the newest entry is
    /// rejected with the number of tracked blocks above the entry its parent
    /// hash does match (the whole window when none does).
    pub fn push(&mut self, header: BlockSummary) -> Result<(), u64> {
        match self.headers.back() {
            Some(newest) if header.number == newest.number + 1 => {
                if !header.extends(newest) {
                    return Err(self.blocks_above_parent(&header));
                }
            }
            Some(_) => self.headers.clear(),
            None => {}
        }
        if self.headers.len() == self.capacity {
            self.headers.pop_front();
        }
        self.headers.push_back(header);
        Ok(())
    }

    /// Restart from a checkpointed block whose own parent is unknown.
    pub fn seed(&mut self, number: u64, hash: B256) {
        self.headers.clear();
        self.headers.push_back(BlockSummary {
            number,
            hash,
            parent_hash: B256::ZERO,
            timestamp: 0,
        });
    }

    pub fn head(&self) -> Option<&BlockSummary> {
        self.headers.back()
    }

    /// Hash recorded for `number`, if it is still in the window.
    pub fn hash_of(&self, number: u64) -> Option<B256> {
        self.headers
            .iter()
            .rev()
            .find(|b| b.number == number)
            .map(|b| b.hash)
    }

    pub fn newest_first(&self) -> impl Iterator<Item = &BlockSummary> {
        self.headers.iter().rev()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Forget every block above `number`.
    pub fn rewind_to(&mut self, number: u64) {
        while self.headers.back().is_some_and(|b| b.number > number) {
            self.headers.pop_back();
        }
    }

    pub fn reset(&mut self) {
        self.headers.clear();
    }

    fn blocks_above_parent(&self, header: &BlockSummary) -> u64 {
        self.newest_first()
            .position(|b| b.hash == header.parent_hash)
            .unwrap_or(self.headers.len()) as u64
    }
}
