//! The per-block chain-index trie: number → block id along one chain.
//! Each commit extends the parent's index root; the resulting root is
//! recorded per block id so the pruner can diff index versions.

use crate::store::NodeStore;
use crate::trie::{Trie, EMPTY_ROOT};
use crate::{Result, StateError};
use std::sync::Arc;
use thorium_storage::KvStore;
use thorium_types::{BlockId, B256};

const SPACE_INDEX_ROOTS: &str = "chain.index-roots";

/// Extends `parent_root` with `block_id`, persists the new nodes and the
/// root-per-block record, and returns the new index root.
pub fn extend(
    store: &dyn NodeStore,
    kv: &Arc<dyn KvStore>,
    parent_root: B256,
    block_id: BlockId,
) -> Result<B256> {
    let mut trie = Trie::open(store, parent_root);
    trie.insert(&block_id.number().to_be_bytes(), block_id.as_bytes().to_vec())?;
    let mut nodes = Vec::new();
    let root = trie.commit(&mut nodes)?;
    for (hash, bytes) in nodes {
        store.put_node(&hash, &bytes, block_id.number())?;
    }
    let mut batch = kv.batch();
    batch.put(SPACE_INDEX_ROOTS, block_id.as_bytes(), root.as_slice());
    batch.write()?;
    Ok(root)
}

/// The index root recorded when `block_id` was committed; the empty root
/// for blocks committed before index tracking (genesis included).
pub fn root_of(kv: &Arc<dyn KvStore>, block_id: BlockId) -> Result<B256> {
    match kv.get(SPACE_INDEX_ROOTS, block_id.as_bytes())? {
        None => Ok(EMPTY_ROOT),
        Some(raw) if raw.len() == 32 => Ok(B256::from_slice(&raw)),
        Some(raw) => Err(StateError::Corrupt(format!(
            "index root of {} bytes",
            raw.len()
        ))),
    }
}
