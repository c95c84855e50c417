//! Min-heap of blocks whose target time lies ahead, keyed by header
//! timestamp. Pops are retry attempts, not guarantees.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use thorium_types::{Block, BlockId};

struct Entry {
    timestamp: u64,
    /// Tie-breaker keeping pops stable for equal timestamps.
    seq: u64,
    block: Arc<Block>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest first.
        (other.timestamp, other.seq).cmp(&(self.timestamp, self.seq))
    }
}

#[derive(Default)]
pub struct FutureHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl FutureHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// No dedup by id; callers check [`FutureHeap::contains`] first.
    pub fn push(&mut self, block: Arc<Block>) {
        let timestamp = block.header().timestamp;
        self.heap.push(Entry {
            timestamp,
            seq: self.next_seq,
            block,
        });
        self.next_seq += 1;
    }

    /// The earliest block whose time has arrived, if any.
    pub fn pop_expired(&mut self, now: u64) -> Option<Arc<Block>> {
        if self.heap.peek()?.timestamp <= now {
            return self.heap.pop().map(|entry| entry.block);
        }
        None
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.heap.iter().any(|entry| entry.block.id() == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thorium_types::block::txs_root;
    use thorium_types::receipt::receipts_root;
    use thorium_types::{Address, Bytes, Features, Header, B256};

    fn block_at(timestamp: u64, salt: u8) -> Arc<Block> {
        Arc::new(Block::new(
            Header {
                parent_id: BlockId::new(0, B256::repeat_byte(salt)),
                timestamp,
                gas_limit: 10_000_000,
                beneficiary: Address::ZERO,
                gas_used: 0,
                total_score: 1,
                txs_root: txs_root(&[]),
                state_root: B256::repeat_byte(salt),
                receipts_root: receipts_root(&[]),
                features: Features::default(),
                signature: Bytes::new(),
            },
            Vec::new(),
        ))
    }

    #[test]
    fn pops_come_out_in_timestamp_order() {
        let mut heap = FutureHeap::new();
        heap.push(block_at(300, 1));
        heap.push(block_at(100, 2));
        heap.push(block_at(200, 3));

        let mut seen = Vec::new();
        while let Some(block) = heap.pop_expired(1_000) {
            seen.push(block.header().timestamp);
        }
        assert_eq!(seen, vec![100, 200, 300]);
        assert!(heap.is_empty());
    }

    #[test]
    fn unexpired_blocks_stay_put() {
        let mut heap = FutureHeap::new();
        heap.push(block_at(500, 1));
        assert!(heap.pop_expired(499).is_none());
        assert_eq!(heap.len(), 1);
        assert!(heap.pop_expired(500).is_some());
    }

    #[test]
    fn contains_matches_by_id() {
        let mut heap = FutureHeap::new();
        let block = block_at(100, 1);
        let id = block.id();
        heap.push(block);
        assert!(heap.contains(id));
        assert!(!heap.contains(BlockId::new(9, B256::repeat_byte(9))));
    }

    #[test]
    fn equal_timestamps_pop_in_push_order() {
        let mut heap = FutureHeap::new();
        let first = block_at(100, 1);
        let second = block_at(100, 2);
        let first_id = first.id();
        heap.push(first);
        heap.push(second);
        assert_eq!(heap.pop_expired(100).unwrap().id(), first_id);
    }
}
