//! Spaced trie-node storage: two rotating live spaces plus a permanent
//! archive. New nodes land in the current live space with a last-reference
//! journal entry; the pruner copies still-needed nodes into the archive,
//! retires the previous space and sweeps it.

use crate::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thorium_storage::KvStore;
use thorium_types::B256;
use tracing::debug;

const SPACE_LIVE: [&str; 2] = ["trie.live.0", "trie.live.1"];
const SPACE_ARCHIVE: &str = "trie.archive";
const SPACE_JOURNAL: [&str; 2] = ["trie.journal.0", "trie.journal.1"];
const SPACE_META: &str = "trie.meta";
const KEY_SLOT: &[u8] = b"slot";

/// Read/write access to trie nodes.
pub trait NodeStore: Send + Sync {
    fn get_node(&self, hash: &B256) -> Result<Option<Vec<u8>>>;
    /// Persists a node and journals `ref_number` as its last reference.
    fn put_node(&self, hash: &B256, bytes: &[u8], ref_number: u32) -> Result<()>;
}

/// The production [`NodeStore`], with the space plumbing the pruner drives.
pub struct SpacedNodeStore {
    kv: Arc<dyn KvStore>,
    slot: AtomicU8,
}

impl SpacedNodeStore {
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        let slot = match kv.get(SPACE_META, KEY_SLOT)? {
            Some(raw) if raw.first() == Some(&1) => 1,
            _ => 0,
        };
        Ok(Self {
            kv,
            slot: AtomicU8::new(slot),
        })
    }

    pub fn current_slot(&self) -> u8 {
        self.slot.load(Ordering::Acquire)
    }

    /// Rotates the live space; subsequent writes land in the other slot.
    pub fn switch_slot(&self) -> Result<u8> {
        let next = 1 - self.current_slot();
        let mut batch = self.kv.batch();
        batch.put(SPACE_META, KEY_SLOT, &[next]);
        batch.write()?;
        self.slot.store(next, Ordering::Release);
        debug!(slot = next, "live trie space switched");
        Ok(next)
    }

    /// Copies a node into the archive space.
    pub fn archive_node(&self, hash: &B256, bytes: &[u8]) -> Result<()> {
        let mut batch = self.kv.batch();
        batch.put(SPACE_ARCHIVE, hash.as_slice(), bytes);
        batch.write()?;
        Ok(())
    }

    /// Deletes nodes in the retired (non-current) space whose journalled
    /// last reference is at or below `upto`. Returns how many went away.
    pub fn sweep_retired(&self, upto: u32) -> Result<usize> {
        let retired = (1 - self.current_slot()) as usize;
        let mut swept = 0;
        let mut batch = self.kv.batch();
        for (key, value) in self.kv.scan_prefix(SPACE_JOURNAL[retired], &[])? {
            let last_ref = u32::from_be_bytes(
                value
                    .as_slice()
                    .try_into()
                    .unwrap_or([0xff, 0xff, 0xff, 0xff]),
            );
            if last_ref <= upto {
                batch.delete(SPACE_LIVE[retired], &key);
                batch.delete(SPACE_JOURNAL[retired], &key);
                swept += 1;
            }
        }
        batch.write()?;
        Ok(swept)
    }
}

impl NodeStore for SpacedNodeStore {
    fn get_node(&self, hash: &B256) -> Result<Option<Vec<u8>>> {
        let current = self.current_slot() as usize;
        if let Some(found) = self.kv.get(SPACE_LIVE[current], hash.as_slice())? {
            return Ok(Some(found));
        }
        if let Some(found) = self.kv.get(SPACE_LIVE[1 - current], hash.as_slice())? {
            return Ok(Some(found));
        }
        Ok(self.kv.get(SPACE_ARCHIVE, hash.as_slice())?)
    }

    fn put_node(&self, hash: &B256, bytes: &[u8], ref_number: u32) -> Result<()> {
        let current = self.current_slot() as usize;
        let mut batch = self.kv.batch();
        batch.put(SPACE_LIVE[current], hash.as_slice(), bytes);
        batch.put(
            SPACE_JOURNAL[current],
            hash.as_slice(),
            &ref_number.to_be_bytes(),
        );
        batch.write()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use thorium_storage::MemKv;

    pub(crate) fn mem_node_store() -> SpacedNodeStore {
        SpacedNodeStore::open(Arc::new(MemKv::new())).unwrap()
    }

    #[test]
    fn nodes_survive_a_slot_switch() {
        let store = mem_node_store();
        let hash = B256::repeat_byte(1);
        store.put_node(&hash, b"node", 5).unwrap();
        store.switch_slot().unwrap();
        assert_eq!(store.get_node(&hash).unwrap(), Some(b"node".to_vec()));
    }

    #[test]
    fn slot_persists_across_reopen() {
        let kv = Arc::new(MemKv::new());
        let store = SpacedNodeStore::open(kv.clone()).unwrap();
        assert_eq!(store.current_slot(), 0);
        store.switch_slot().unwrap();
        let reopened = SpacedNodeStore::open(kv).unwrap();
        assert_eq!(reopened.current_slot(), 1);
    }

    #[test]
    fn sweep_deletes_only_old_refs_in_the_retired_space() {
        let store = mem_node_store();
        let old = B256::repeat_byte(1);
        let fresh = B256::repeat_byte(2);
        store.put_node(&old, b"old", 10).unwrap();
        store.put_node(&fresh, b"fresh", 50).unwrap();
        store.switch_slot().unwrap();

        let swept = store.sweep_retired(20).unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.get_node(&old).unwrap(), None);
        assert_eq!(store.get_node(&fresh).unwrap(), Some(b"fresh".to_vec()));
    }

    #[test]
    fn archived_nodes_outlive_sweeps() {
        let store = mem_node_store();
        let hash = B256::repeat_byte(3);
        store.put_node(&hash, b"node", 1).unwrap();
        store.archive_node(&hash, b"node").unwrap();
        store.switch_slot().unwrap();
        store.sweep_retired(u32::MAX).unwrap();
        assert_eq!(store.get_node(&hash).unwrap(), Some(b"node".to_vec()));
    }
}
