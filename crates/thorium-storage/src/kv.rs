//! Keyspaced KV store contract: point reads, consistent snapshots and
//! atomic write batches. The node core never sees the engine behind it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv engine: {0}")]
    Engine(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// A consistent point-in-time view.
pub trait KvSnapshot: Send + Sync {
    fn get(&self, space: &str, key: &[u8]) -> KvResult<Option<Vec<u8>>>;
}

/// A pending atomic write set.
pub trait KvBatch: Send {
    fn put(&mut self, space: &str, key: &[u8], value: &[u8]);
    fn delete(&mut self, space: &str, key: &[u8]);
    /// Applies every staged op as one atomic unit.
    fn write(self: Box<Self>) -> KvResult<()>;
}

pub trait KvStore: Send + Sync {
    fn get(&self, space: &str, key: &[u8]) -> KvResult<Option<Vec<u8>>>;
    fn snapshot(&self) -> Box<dyn KvSnapshot>;
    fn batch(&self) -> Box<dyn KvBatch>;
    /// Key-ordered scan of `space`, restricted to keys starting with
    /// `prefix` (empty prefix scans the whole space).
    fn scan_prefix(&self, space: &str, prefix: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

type Spaces = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory engine backing solo mode and tests.
#[derive(Default)]
pub struct MemKv {
    spaces: Arc<RwLock<Spaces>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKv {
    fn get(&self, space: &str, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let spaces = self.spaces.read().expect("kv lock poisoned");
        Ok(spaces.get(space).and_then(|s| s.get(key).cloned()))
    }

    fn snapshot(&self) -> Box<dyn KvSnapshot> {
        let spaces = self.spaces.read().expect("kv lock poisoned");
        Box::new(MemSnapshot {
            spaces: spaces.clone(),
        })
    }

    fn batch(&self) -> Box<dyn KvBatch> {
        Box::new(MemBatch {
            spaces: self.spaces.clone(),
            ops: Vec::new(),
        })
    }

    fn scan_prefix(&self, space: &str, prefix: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let spaces = self.spaces.read().expect("kv lock poisoned");
        let Some(space) = spaces.get(space) else {
            return Ok(Vec::new());
        };
        Ok(space
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

struct MemSnapshot {
    spaces: Spaces,
}

impl KvSnapshot for MemSnapshot {
    fn get(&self, space: &str, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        Ok(self.spaces.get(space).and_then(|s| s.get(key).cloned()))
    }
}

enum Op {
    Put(String, Vec<u8>, Vec<u8>),
    Delete(String, Vec<u8>),
}

struct MemBatch {
    spaces: Arc<RwLock<Spaces>>,
    ops: Vec<Op>,
}

impl KvBatch for MemBatch {
    fn put(&mut self, space: &str, key: &[u8], value: &[u8]) {
        self.ops
            .push(Op::Put(space.to_string(), key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, space: &str, key: &[u8]) {
        self.ops.push(Op::Delete(space.to_string(), key.to_vec()));
    }

    fn write(self: Box<Self>) -> KvResult<()> {
        let mut spaces = self.spaces.write().expect("kv lock poisoned");
        for op in self.ops {
            match op {
                Op::Put(space, key, value) => {
                    spaces.entry(space).or_default().insert(key, value);
                }
                Op::Delete(space, key) => {
                    if let Some(space) = spaces.get_mut(&space) {
                        space.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
