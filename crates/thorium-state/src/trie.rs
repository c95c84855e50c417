//! A radix-16 hash-linked trie. Nodes are content-addressed by the
//! Blake2b-256 of their encoding and live in a [`NodeStore`]; a commit
//! yields the new root plus the freshly created nodes, never touching the
//! previous version. No extension nodes: a shared prefix is a chain of
//! branches, which keeps the node shapes to two.

use crate::store::NodeStore;
use crate::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thorium_types::crypto::blake2b256;
use thorium_types::B256;

/// Root of a trie with no entries.
pub const EMPTY_ROOT: B256 = B256::ZERO;

#[derive(Serialize, Deserialize)]
enum StoredNode {
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Branch {
        children: Vec<Option<[u8; 32]>>,
        value: Option<Vec<u8>>,
    },
}

enum MemNode {
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Branch {
        children: Vec<Slot>,
        value: Option<Vec<u8>>,
    },
}

enum Slot {
    Empty,
    /// A persisted, untouched subtree.
    Hash(B256),
    /// A subtree modified in this session.
    Owned(Box<MemNode>),
}

impl Slot {
    fn take(&mut self) -> Slot {
        std::mem::replace(self, Slot::Empty)
    }
}

/// One mutable session over a rooted trie.
pub struct Trie<'a> {
    store: &'a dyn NodeStore,
    root: Slot,
}

impl<'a> Trie<'a> {
    pub fn open(store: &'a dyn NodeStore, root: B256) -> Self {
        let root = if root == EMPTY_ROOT {
            Slot::Empty
        } else {
            Slot::Hash(root)
        };
        Self { store, root }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_slot(&self.root, &to_nibbles(key))
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let root = self.root.take();
        self.root = self.insert_slot(root, &to_nibbles(key), value)?;
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let root = self.root.take();
        self.root = self.remove_slot(root, &to_nibbles(key))?;
        Ok(())
    }

    /// Hashes every modified subtree, appending the new nodes to `out`, and
    /// returns the root.
    pub fn commit(self, out: &mut Vec<(B256, Vec<u8>)>) -> Result<B256> {
        Ok(match commit_slot(self.root, out) {
            Some(hash) => hash,
            None => EMPTY_ROOT,
        })
    }

    fn load(&self, hash: B256) -> Result<StoredNode> {
        let raw = self
            .store
            .get_node(&hash)?
            .ok_or(StateError::MissingNode(hash))?;
        bcs::from_bytes(&raw).map_err(|e| StateError::Corrupt(e.to_string()))
    }

    fn get_slot(&self, slot: &Slot, nibbles: &[u8]) -> Result<Option<Vec<u8>>> {
        match slot {
            Slot::Empty => Ok(None),
            Slot::Hash(hash) => self.get_stored(*hash, nibbles),
            Slot::Owned(node) => match node.as_ref() {
                MemNode::Leaf { path, value } => Ok((path == nibbles).then(|| value.clone())),
                MemNode::Branch { children, value } => match nibbles.split_first() {
                    None => Ok(value.clone()),
                    Some((first, rest)) => self.get_slot(&children[*first as usize], rest),
                },
            },
        }
    }

    fn get_stored(&self, hash: B256, nibbles: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.load(hash)? {
            StoredNode::Leaf { path, value } => Ok((path == nibbles).then_some(value)),
            StoredNode::Branch { children, value } => match nibbles.split_first() {
                None => Ok(value),
                Some((first, rest)) => match children[*first as usize] {
                    None => Ok(None),
                    Some(child) => self.get_stored(B256::new(child), rest),
                },
            },
        }
    }

    fn resolve(&self, slot: Slot) -> Result<Slot> {
        match slot {
            Slot::Hash(hash) => {
                let node = match self.load(hash)? {
                    StoredNode::Leaf { path, value } => MemNode::Leaf { path, value },
                    StoredNode::Branch { children, value } => MemNode::Branch {
                        children: children
                            .into_iter()
                            .map(|child| match child {
                                None => Slot::Empty,
                                Some(hash) => Slot::Hash(B256::new(hash)),
                            })
                            .collect(),
                        value,
                    },
                };
                Ok(Slot::Owned(Box::new(node)))
            }
            other => Ok(other),
        }
    }

    fn insert_slot(&self, slot: Slot, nibbles: &[u8], value: Vec<u8>) -> Result<Slot> {
        let slot = self.resolve(slot)?;
        match slot {
            Slot::Empty => Ok(Slot::Owned(Box::new(MemNode::Leaf {
                path: nibbles.to_vec(),
                value,
            }))),
            Slot::Owned(node) => match *node {
                MemNode::Leaf {
                    path,
                    value: old_value,
                } => {
                    if path == nibbles {
                        return Ok(Slot::Owned(Box::new(MemNode::Leaf {
                            path,
                            value,
                        })));
                    }
                    // Split into a branch and re-insert both entries below it.
                    let mut children: Vec<Slot> = (0..16).map(|_| Slot::Empty).collect();
                    let mut branch_value = None;
                    match path.split_first() {
                        None => branch_value = Some(old_value),
                        Some((first, rest)) => {
                            children[*first as usize] = Slot::Owned(Box::new(MemNode::Leaf {
                                path: rest.to_vec(),
                                value: old_value,
                            }));
                        }
                    }
                    let branch = Slot::Owned(Box::new(MemNode::Branch {
                        children,
                        value: branch_value,
                    }));
                    self.insert_slot(branch, nibbles, value)
                }
                MemNode::Branch {
                    mut children,
                    value: branch_value,
                } => match nibbles.split_first() {
                    None => Ok(Slot::Owned(Box::new(MemNode::Branch {
                        children,
                        value: Some(value),
                    }))),
                    Some((first, rest)) => {
                        let child = children[*first as usize].take();
                        children[*first as usize] = self.insert_slot(child, rest, value)?;
                        Ok(Slot::Owned(Box::new(MemNode::Branch {
                            children,
                            value: branch_value,
                        })))
                    }
                },
            },
            Slot::Hash(_) => unreachable!("resolved above"),
        }
    }

    fn remove_slot(&self, slot: Slot, nibbles: &[u8]) -> Result<Slot> {
        let slot = self.resolve(slot)?;
        match slot {
            Slot::Empty => Ok(Slot::Empty),
            Slot::Owned(node) => match *node {
                MemNode::Leaf { path, value } => {
                    if path == nibbles {
                        Ok(Slot::Empty)
                    } else {
                        Ok(Slot::Owned(Box::new(MemNode::Leaf { path, value })))
                    }
                }
                MemNode::Branch { mut children, value } => match nibbles.split_first() {
                    None => Ok(Slot::Owned(Box::new(MemNode::Branch {
                        children,
                        value: None,
                    }))),
                    Some((first, rest)) => {
                        let child = children[*first as usize].take();
                        children[*first as usize] = self.remove_slot(child, rest)?;
                        Ok(Slot::Owned(Box::new(MemNode::Branch { children, value })))
                    }
                },
            },
            Slot::Hash(_) => unreachable!("resolved above"),
        }
    }
}

fn commit_slot(slot: Slot, out: &mut Vec<(B256, Vec<u8>)>) -> Option<B256> {
    match slot {
        Slot::Empty => None,
        Slot::Hash(hash) => Some(hash),
        Slot::Owned(node) => {
            let stored = match *node {
                MemNode::Leaf { path, value } => StoredNode::Leaf { path, value },
                MemNode::Branch { children, value } => StoredNode::Branch {
                    children: children
                        .into_iter()
                        .map(|child| commit_slot(child, out).map(|h| h.0))
                        .collect(),
                    value,
                },
            };
            let bytes = bcs::to_bytes(&stored).expect("node encode");
            let hash = blake2b256(&[&bytes]);
            out.push((hash, bytes));
            Some(hash)
        }
    }
}

fn to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(key.len() * 2);
    for byte in key {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

fn from_nibbles(nibbles: &[u8]) -> Vec<u8> {
    nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

fn load_raw(store: &dyn NodeStore, hash: B256) -> Result<(Vec<u8>, StoredNode)> {
    let raw = store
        .get_node(&hash)?
        .ok_or(StateError::MissingNode(hash))?;
    let node = bcs::from_bytes(&raw).map_err(|e| StateError::Corrupt(e.to_string()))?;
    Ok((raw, node))
}

/// Every node hash reachable from `root`.
pub fn reachable(store: &dyn NodeStore, root: B256) -> Result<HashSet<B256>> {
    let mut seen = HashSet::new();
    if root == EMPTY_ROOT {
        return Ok(seen);
    }
    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        if !seen.insert(hash) {
            continue;
        }
        let (_, node) = load_raw(store, hash)?;
        if let StoredNode::Branch { children, .. } = node {
            stack.extend(children.into_iter().flatten().map(B256::new));
        }
    }
    Ok(seen)
}

/// All `(key, value)` leaves under `root`.
pub fn leaves(store: &dyn NodeStore, root: B256) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    if root == EMPTY_ROOT {
        return Ok(out);
    }
    collect_leaves(store, root, &mut Vec::new(), &mut out)?;
    Ok(out)
}

fn collect_leaves(
    store: &dyn NodeStore,
    hash: B256,
    prefix: &mut Vec<u8>,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let (_, node) = load_raw(store, hash)?;
    match node {
        StoredNode::Leaf { path, value } => {
            let mut nibbles = prefix.clone();
            nibbles.extend_from_slice(&path);
            out.push((from_nibbles(&nibbles), value));
        }
        StoredNode::Branch { children, value } => {
            if let Some(value) = value {
                out.push((from_nibbles(prefix), value));
            }
            for (index, child) in children.into_iter().enumerate() {
                if let Some(child) = child {
                    prefix.push(index as u8);
                    collect_leaves(store, B256::new(child), prefix, out)?;
                    prefix.pop();
                }
            }
        }
    }
    Ok(())
}

/// Visits every node reachable from `new_root` but not from `old_root`.
/// Subtrees shared with the old version are skipped whole, since equal
/// hashes imply equal descendants.
pub fn walk_diff(
    store: &dyn NodeStore,
    new_root: B256,
    old_root: B256,
    visit: &mut dyn FnMut(B256, &[u8]) -> Result<()>,
) -> Result<()> {
    let old = reachable(store, old_root)?;
    if new_root == EMPTY_ROOT {
        return Ok(());
    }
    let mut stack = vec![new_root];
    let mut seen = HashSet::new();
    while let Some(hash) = stack.pop() {
        if old.contains(&hash) || !seen.insert(hash) {
            continue;
        }
        let (raw, node) = load_raw(store, hash)?;
        visit(hash, &raw)?;
        if let StoredNode::Branch { children, .. } = node {
            stack.extend(children.into_iter().flatten().map(B256::new));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::mem_node_store;

    fn commit_all(store: &dyn NodeStore, trie: Trie<'_>, number: u32) -> B256 {
        let mut nodes = Vec::new();
        let root = trie.commit(&mut nodes).unwrap();
        for (hash, bytes) in nodes {
            store.put_node(&hash, &bytes, number).unwrap();
        }
        root
    }

    #[test]
    fn empty_trie_has_the_sentinel_root() {
        let store = mem_node_store();
        let trie = Trie::open(&store, EMPTY_ROOT);
        let mut nodes = Vec::new();
        assert_eq!(trie.commit(&mut nodes).unwrap(), EMPTY_ROOT);
        assert!(nodes.is_empty());
    }

    #[test]
    fn insert_get_across_commits() {
        let store = mem_node_store();
        let mut trie = Trie::open(&store, EMPTY_ROOT);
        trie.insert(b"abc", b"1".to_vec()).unwrap();
        trie.insert(b"abd", b"2".to_vec()).unwrap();
        trie.insert(b"x", b"3".to_vec()).unwrap();
        assert_eq!(trie.get(b"abc").unwrap(), Some(b"1".to_vec()));
        let root = commit_all(&store, trie, 1);

        let reopened = Trie::open(&store, root);
        assert_eq!(reopened.get(b"abc").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reopened.get(b"abd").unwrap(), Some(b"2".to_vec()));
        assert_eq!(reopened.get(b"x").unwrap(), Some(b"3".to_vec()));
        assert_eq!(reopened.get(b"ab").unwrap(), None);
    }

    #[test]
    fn identical_content_gives_identical_roots() {
        let store = mem_node_store();
        let mut a = Trie::open(&store, EMPTY_ROOT);
        a.insert(b"k1", b"v1".to_vec()).unwrap();
        a.insert(b"k2", b"v2".to_vec()).unwrap();
        let root_a = commit_all(&store, a, 1);

        let mut b = Trie::open(&store, EMPTY_ROOT);
        b.insert(b"k1", b"v1".to_vec()).unwrap();
        b.insert(b"k2", b"v2".to_vec()).unwrap();
        let root_b = commit_all(&store, b, 2);
        assert_eq!(root_a, root_b);
    }

    #[test]
    fn old_version_remains_readable_after_update() {
        let store = mem_node_store();
        let mut trie = Trie::open(&store, EMPTY_ROOT);
        trie.insert(b"key", b"old".to_vec()).unwrap();
        let root_v1 = commit_all(&store, trie, 1);

        let mut trie = Trie::open(&store, root_v1);
        trie.insert(b"key", b"new".to_vec()).unwrap();
        let root_v2 = commit_all(&store, trie, 2);

        assert_ne!(root_v1, root_v2);
        assert_eq!(
            Trie::open(&store, root_v1).get(b"key").unwrap(),
            Some(b"old".to_vec())
        );
        assert_eq!(
            Trie::open(&store, root_v2).get(b"key").unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn remove_clears_the_entry() {
        let store = mem_node_store();
        let mut trie = Trie::open(&store, EMPTY_ROOT);
        trie.insert(b"keep", b"1".to_vec()).unwrap();
        trie.insert(b"drop", b"2".to_vec()).unwrap();
        trie.remove(b"drop").unwrap();
        trie.remove(b"never-there").unwrap();
        let root = commit_all(&store, trie, 1);
        let reopened = Trie::open(&store, root);
        assert_eq!(reopened.get(b"keep").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reopened.get(b"drop").unwrap(), None);
    }

    #[test]
    fn leaves_enumerates_full_keys() {
        let store = mem_node_store();
        let mut trie = Trie::open(&store, EMPTY_ROOT);
        trie.insert(b"aa", b"1".to_vec()).unwrap();
        trie.insert(b"ab", b"2".to_vec()).unwrap();
        let root = commit_all(&store, trie, 1);
        let mut found = leaves(&store, root).unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                (b"aa".to_vec(), b"1".to_vec()),
                (b"ab".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn walk_diff_skips_shared_subtrees() {
        let store = mem_node_store();
        let mut trie = Trie::open(&store, EMPTY_ROOT);
        trie.insert(b"stable", b"same".to_vec()).unwrap();
        trie.insert(b"hot", b"v1".to_vec()).unwrap();
        let root_v1 = commit_all(&store, trie, 1);

        let mut trie = Trie::open(&store, root_v1);
        trie.insert(b"hot", b"v2".to_vec()).unwrap();
        let root_v2 = commit_all(&store, trie, 2);

        let mut fresh = Vec::new();
        walk_diff(&store, root_v2, root_v1, &mut |hash, _| {
            fresh.push(hash);
            Ok(())
        })
        .unwrap();
        assert!(!fresh.is_empty());

        let all_v2 = reachable(&store, root_v2).unwrap();
        let all_v1 = reachable(&store, root_v1).unwrap();
        let expected: HashSet<B256> = all_v2.difference(&all_v1).copied().collect();
        assert_eq!(fresh.iter().copied().collect::<HashSet<_>>(), expected);
    }
}
