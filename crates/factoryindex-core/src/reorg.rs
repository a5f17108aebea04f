//! Reorg detection and recovery bookkeeping.
//!
//! The [`ReorgDetector`] owns the [`BlockTracker`] window and classifies each
//! new header as extending the tracked chain, starting a new window (gap), or
//! contradicting it. On contradiction the caller walks
//! [`ReorgDetector::candidates`] newest-first, compares each against the
//! canonical chain, and hands the first match to [`ReorgDetector::resolve`].

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::tracker::BlockTracker;
use crate::types::{BlockSummary, ChainId};

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    pub chain_id: ChainId,
    /// The block whose header exposed the fork.
    pub detected_at: u64,
    /// First block no longer canonical (`safe_ancestor + 1`).
    pub invalidated_block: u64,
    /// Last block known to be on both forks.
    pub safe_ancestor: u64,
    /// Number of tracked blocks rolled back.
    pub depth: u64,
    /// The blocks that were dropped, most recent first.
    pub dropped: Vec<BlockSummary>,
}

/// Outcome of observing one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderCheck {
    /// The header extends the tracked head (or the window was empty).
    Extends,
    /// The header does not follow the tracked head; the window restarted.
    Gap,
    /// The header's parent disagrees with the tracked block before it.
    Mismatch {
        /// The offending header's number.
        at: u64,
    },
}

/// Detects chain reorganizations over a sliding header window.
pub struct ReorgDetector {
    chain_id: ChainId,
    tracker: BlockTracker,
}

impl ReorgDetector {
    pub fn new(chain_id: ChainId, window_size: usize) -> Self {
        Self {
            chain_id,
            tracker: BlockTracker::new(window_size),
        }
    }

    pub fn tracker(&self) -> &BlockTracker {
        &self.tracker
    }

    /// Seed the window from a persisted checkpoint.
    pub fn seed(&mut self, number: u64, hash: B256) {
        self.tracker.seed(number, hash);
    }

    /// Check `header` against the window and track it unless it contradicts it.
    pub fn observe(&mut self, header: BlockSummary) -> HeaderCheck {
        let number = header.number;
        let gap = self
            .tracker
            .head()
            .is_some_and(|head| head.number + 1 != number);
        match self.tracker.push(header) {
            Ok(()) if gap => HeaderCheck::Gap,
            Ok(()) => HeaderCheck::Extends,
            Err(depth) => {
                tracing::warn!(
                    chain_id = self.chain_id,
                    at = number,
                    depth,
                    "Parent hash mismatch"
                );
                HeaderCheck::Mismatch { at: number }
            }
        }
    }

    /// Tracked `(number, hash)` pairs to compare against the canonical chain,
    /// newest first.
    pub fn candidates(&self) -> Vec<(u64, B256)> {
        self.tracker
            .newest_first()
            .map(|b| (b.number, b.hash))
            .collect()
    }

    /// Oldest tracked block number, if any.
    pub fn oldest_tracked(&self) -> Option<u64> {
        self.tracker.newest_first().last().map(|b| b.number)
    }

    /// Build the [`ReorgEvent`] for a fork with last common block
    /// `safe_ancestor`, and rewind the window to it.
    pub fn resolve(&mut self, safe_ancestor: u64, detected_at: u64) -> ReorgEvent {
        let dropped: Vec<BlockSummary> = self
            .tracker
            .newest_first()
            .take_while(|b| b.number > safe_ancestor)
            .cloned()
            .collect();
        self.tracker.rewind_to(safe_ancestor);

        let event = ReorgEvent {
            chain_id: self.chain_id,
            detected_at,
            invalidated_block: safe_ancestor + 1,
            safe_ancestor,
            depth: dropped.len() as u64,
            dropped,
        };
        tracing::warn!(
            chain_id = self.chain_id,
            detected_at,
            safe_ancestor,
            depth = event.depth,
            "Reorg detected"
        );
        event
    }

    /// Discard tracked blocks above `block_number`.
    pub fn rewind_to(&mut self, block_number: u64) {
        self.tracker.rewind_to(block_number);
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u64, fork: u8) -> B256 {
        let mut bytes = [0u8; 32];
        bytes[0] = fork;
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        B256::from(bytes)
    }

    fn header(n: u64, fork: u8, parent_fork: u8) -> BlockSummary {
        BlockSummary {
            number: n,
            hash: h(n, fork),
            parent_hash: h(n - 1, parent_fork),
            timestamp: n * 2,
        }
    }

    #[test]
    fn no_reorg_on_normal_chain() {
        let mut det = ReorgDetector::new(8453, 16);
        assert_eq!(det.observe(header(100, 0, 0)), HeaderCheck::Extends);
        assert_eq!(det.observe(header(101, 0, 0)), HeaderCheck::Extends);
        assert_eq!(det.observe(header(110, 0, 0)), HeaderCheck::Gap);
    }

    #[test]
    fn mismatch_then_resolve() {
        let mut det = ReorgDetector::new(8453, 16);
        for n in 98..=102 {
            det.observe(header(n, 0, 0));
        }
        // block 103 on fork 1 whose parent 102 is also on fork 1
        assert_eq!(
            det.observe(header(103, 1, 1)),
            HeaderCheck::Mismatch { at: 103 }
        );
        assert_eq!(det.candidates()[0], (102, h(102, 0)));

        // caller found block 100 still canonical
        let event = det.resolve(100, 103);
        assert_eq!(event.safe_ancestor, 100);
        assert_eq!(event.invalidated_block, 101);
        assert_eq!(event.depth, 2);
        assert_eq!(event.dropped[0].number, 102);
        assert_eq!(det.tracker().head().unwrap().number, 100);
    }

    #[test]
    fn oldest_tracked_block() {
        let mut det = ReorgDetector::new(1, 3);
        for n in 10..=15 {
            det.observe(header(n, 0, 0));
        }
        assert_eq!(det.oldest_tracked(), Some(13));
    }
}
