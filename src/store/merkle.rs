//! # Merkle Tree
//!
//! Binary Merkle tree over the versioned key space, used for anti-entropy
//! reconciliation (§4.H): two nodes compare root hashes first, and only
//! exchange leaf hashes (then full entries) for the keys that disagree.
//!
//! Leaf hashes cover the entry's full identity (value, version, and
//! tombstone bit), not just the value, so a tombstone and a live entry
//! under the same key never collide, and replaying the same value under a
//! newer version still changes the leaf.
//!
//! This rebuilds the whole tree on every change, same as the teacher's
//! original implementation. Fine for edge-device key counts; an incremental
//! tree would trade this simplicity for update complexity this crate
//! doesn't need yet.

use crate::model::{Version, VersionedEntry};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct MerkleNode {
    pub hash: Vec<u8>,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
}

/// Merkle tree over `(key, VersionedEntry)` pairs.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    pub root: Option<MerkleNode>,
    leaf_map: HashMap<String, Vec<u8>>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self {
            root: None,
            leaf_map: HashMap::new(),
        }
    }

    /// Insert or update a key's leaf hash and rebuild the tree.
    pub fn upsert(&mut self, key: &str, entry: &VersionedEntry) {
        let hash = leaf_hash(key, entry);
        self.leaf_map.insert(key.to_string(), hash);
        self.rebuild();
    }

    pub fn remove(&mut self, key: &str) {
        self.leaf_map.remove(key);
        self.rebuild();
    }

    pub fn root_hash(&self) -> Option<&[u8]> {
        self.root.as_ref().map(|node| node.hash.as_slice())
    }

    /// Leaf hashes sorted by key, in fixed-size chunks, for anti-entropy
    /// exchange (§4.H). A chunk size of 0 returns a single chunk with
    /// everything.
    pub fn chunked_leaves(&self, chunk_size: usize) -> Vec<Vec<(String, Vec<u8>)>> {
        let mut leaves: Vec<(String, Vec<u8>)> = self
            .leaf_map
            .iter()
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect();
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        if chunk_size == 0 {
            return vec![leaves];
        }
        leaves
            .chunks(chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Keys present in `self` whose leaf hash disagrees with (or is absent
    /// from) `other`, plus keys present only in `other`. The caller fetches
    /// full entries for whichever side is missing or stale.
    pub fn diff_keys(&self, other: &HashMap<String, Vec<u8>>) -> Vec<String> {
        let mut diff = Vec::new();
        for (key, hash) in &self.leaf_map {
            if other.get(key) != Some(hash) {
                diff.push(key.clone());
            }
        }
        for key in other.keys() {
            if !self.leaf_map.contains_key(key) {
                diff.push(key.clone());
            }
        }
        diff.sort();
        diff.dedup();
        diff
    }

    fn rebuild(&mut self) {
        if self.leaf_map.is_empty() {
            self.root = None;
            return;
        }

        let mut keys: Vec<&String> = self.leaf_map.keys().collect();
        keys.sort();
        let mut nodes: Vec<MerkleNode> = keys
            .into_iter()
            .map(|k| MerkleNode {
                hash: self.leaf_map[k].clone(),
                left: None,
                right: None,
            })
            .collect();

        while nodes.len() > 1 {
            let mut next = Vec::with_capacity(nodes.len().div_ceil(2));
            for pair in nodes.chunks(2) {
                if pair.len() == 2 {
                    let mut hasher = Sha256::new();
                    hasher.update(&pair[0].hash);
                    hasher.update(&pair[1].hash);
                    next.push(MerkleNode {
                        hash: hasher.finalize().to_vec(),
                        left: Some(Box::new(pair[0].clone())),
                        right: Some(Box::new(pair[1].clone())),
                    });
                } else {
                    next.push(pair[0].clone());
                }
            }
            nodes = next;
        }

        self.root = nodes.into_iter().next();
    }
}

fn leaf_hash(key: &str, entry: &VersionedEntry) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update([entry.tombstone as u8]);
    hasher.update(entry.version.timestamp_ms.to_le_bytes());
    hasher.update(entry.version.node_id.as_bytes());
    hasher.update([0u8]);
    if let Some(v) = &entry.value {
        hasher.update(v.as_bytes());
    }
    hasher.finalize().to_vec()
}

/// Deterministic leaf hash for a not-yet-applied `(key, value, version)`
/// triple. Useful for tests and for anti-entropy code that wants a hash
/// without committing an entry to the store first.
pub fn leaf_hash_for(key: &str, value: Option<&str>, version: &Version, tombstone: bool) -> Vec<u8> {
    let entry = if tombstone {
        VersionedEntry::tombstone(version.clone(), 0)
    } else {
        VersionedEntry::live(value.unwrap_or_default().to_string(), version.clone(), 0)
    };
    leaf_hash(key, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: &str, ts: u64) -> VersionedEntry {
        VersionedEntry::live(value.to_string(), Version::new(ts, "n1"), 0)
    }

    #[test]
    fn empty_tree_has_no_root() {
        let tree = MerkleTree::new();
        assert!(tree.root_hash().is_none());
    }

    #[test]
    fn root_changes_when_value_changes() {
        let mut tree = MerkleTree::new();
        tree.upsert("k1", &entry("v1", 100));
        let before = tree.root_hash().unwrap().to_vec();
        tree.upsert("k1", &entry("v2", 200));
        let after = tree.root_hash().unwrap().to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn removing_last_key_empties_tree() {
        let mut tree = MerkleTree::new();
        tree.upsert("k1", &entry("v1", 100));
        tree.remove("k1");
        assert!(tree.root_hash().is_none());
    }

    #[test]
    fn diff_keys_finds_mismatches_both_directions() {
        let mut a = MerkleTree::new();
        a.upsert("k1", &entry("v1", 100));
        a.upsert("k2", &entry("v2", 100));

        let mut b = MerkleTree::new();
        b.upsert("k1", &entry("v1", 100));
        b.upsert("k3", &entry("v3", 100));

        let other_leaves: HashMap<String, Vec<u8>> =
            b.chunked_leaves(0).into_iter().flatten().collect();
        let diff = a.diff_keys(&other_leaves);
        assert!(diff.contains(&"k2".to_string()));
        assert!(diff.contains(&"k3".to_string()));
        assert!(!diff.contains(&"k1".to_string()));
    }

    #[test]
    fn tombstone_and_live_entry_hash_differently() {
        let mut tree = MerkleTree::new();
        tree.upsert("k1", &entry("", 100));
        let live_hash = tree.root_hash().unwrap().to_vec();
        tree.upsert("k1", &VersionedEntry::tombstone(Version::new(100, "n1"), 0));
        let tombstone_hash = tree.root_hash().unwrap().to_vec();
        assert_ne!(live_hash, tombstone_hash);
    }
}
