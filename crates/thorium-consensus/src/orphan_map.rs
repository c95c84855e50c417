//! Blocks whose parent has not been seen yet, keyed by the missing parent
//! id and aged out after five minutes.

use std::collections::HashMap;
use std::sync::Arc;
use thorium_types::constants::ORPHAN_TTL;
use thorium_types::{Block, BlockId};

#[derive(Default)]
pub struct OrphanMap {
    entries: HashMap<BlockId, (Arc<Block>, u64)>,
}

impl OrphanMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the earlier entry when the parent is already awaited.
    pub fn insert(&mut self, parent_id: BlockId, block: Arc<Block>, now: u64) {
        self.entries.entry(parent_id).or_insert((block, now));
    }

    /// Removes and returns the block waiting on `parent_id`.
    pub fn take(&mut self, parent_id: BlockId) -> Option<Arc<Block>> {
        self.entries.remove(&parent_id).map(|(block, _)| block)
    }

    /// Drops entries older than the TTL.
    pub fn sweep(&mut self, now: u64) {
        self.entries
            .retain(|_, (_, inserted)| now.saturating_sub(*inserted) <= ORPHAN_TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
