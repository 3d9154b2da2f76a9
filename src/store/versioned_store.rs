//! # Versioned Storage Engine
//!
//! The authoritative in-memory key space: every key maps to a
//! [`VersionedEntry`](crate::model::VersionedEntry) carrying a hybrid
//! `(timestamp, nodeId)` version. Local writes and inbound replication
//! events go through the same merge rule (§4.B): an incoming version only
//! replaces the current one if it's strictly greater.
//!
//! This generalizes the teacher's `RwLockEngine` (`RwLock<HashMap>`,
//! read/write lock discipline) to versioned entries, LWW merge semantics,
//! and per-key mutexes guarding the numeric/string read-modify-write paths
//! (§5): a single `RwLock` isn't enough there since two concurrent INCRs
//! on the same key must serialize, not just avoid torn reads.

use crate::error::Error;
use crate::model::{
    validate_value, Version, VersionedEntry, MAX_VALUE_BYTES,
};
use crate::store::merkle::MerkleTree;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

/// Lazily-created per-key async locks, so concurrent RMW ops on different
/// keys never block each other. Entries with no outstanding holder besides
/// the registry itself are pruned on access to bound memory growth.
#[derive(Default)]
struct KeyLocks {
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("key lock registry poisoned");
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub struct VersionedStore {
    entries: RwLock<HashMap<String, VersionedEntry>>,
    merkle: StdMutex<MerkleTree>,
    key_locks: KeyLocks,
    sequence: std::sync::atomic::AtomicU64,
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            merkle: StdMutex::new(MerkleTree::new()),
            key_locks: KeyLocks::default(),
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// `get(key) → value?` (§4.B). Tombstones read as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().expect("store poisoned");
        entries
            .get(key)
            .filter(|e| !e.tombstone)
            .and_then(|e| e.value.clone())
    }

    fn current(&self, key: &str) -> Option<VersionedEntry> {
        let entries = self.entries.read().expect("store poisoned");
        entries.get(key).cloned()
    }

    /// Unconditionally store `entry` if its version wins over whatever is
    /// currently there, updating the Merkle leaf in the same step. Returns
    /// whether the write was applied. Callers issuing a local write (as
    /// opposed to merging a remote event, where a lost race is normal and
    /// silent) must check this and surface a failure when it's false,
    /// rather than reporting success for a write that never landed.
    fn commit(&self, key: &str, entry: VersionedEntry) -> bool {
        let mut entries = self.entries.write().expect("store poisoned");
        let applies = match entries.get(key) {
            Some(existing) => entry.supersedes(existing),
            None => true,
        };
        if applies {
            let mut merkle = self.merkle.lock().expect("merkle lock poisoned");
            merkle.upsert(key, &entry);
            entries.insert(key.to_string(), entry);
        }
        applies
    }

    /// `put(key, value, version)` (§4.B): a local SET.
    pub fn put(&self, key: &str, value: String, version: Version) -> Result<bool, Error> {
        validate_value(&value).map_err(|reason| Error::Validation {
            field: "value",
            value: value.clone(),
            reason,
        })?;
        let sequence = self.next_sequence();
        Ok(self.commit(key, VersionedEntry::live(value, version, sequence)))
    }

    /// `delete(key, version)` (§4.B): writes a tombstone under `version`.
    pub fn delete(&self, key: &str, version: Version) -> bool {
        let sequence = self.next_sequence();
        self.commit(key, VersionedEntry::tombstone(version, sequence))
    }

    /// `applyRemote(event) → applied` (§4.B/§4.H): the replication apply
    /// path. Identical merge rule to a local write.
    pub fn apply_remote(&self, key: &str, entry: VersionedEntry) -> bool {
        self.commit(key, entry)
    }

    /// INCR/DECR (§4.B): atomic read-modify-write under the key's lock.
    /// Missing/tombstoned values start from 0; overflow is `RangeOverflow`.
    pub async fn add(&self, key: &str, delta: i64, version: Version) -> Result<i64, Error> {
        let lock = self.key_locks.get(key);
        let _guard = lock.lock().await;

        let current = match self.current(key) {
            Some(e) if !e.tombstone => e
                .value
                .unwrap_or_default()
                .parse::<i64>()
                .map_err(|_| Error::InvalidType {
                    key: key.to_string(),
                    expected: "integer",
                })?,
            _ => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::RangeOverflow { key: key.to_string() })?;

        let sequence = self.next_sequence();
        let applied = self.commit(
            key,
            VersionedEntry::live(next.to_string(), version, sequence),
        );
        if !applied {
            return Err(Error::Internal(format!(
                "write to '{key}' lost to a concurrent version"
            )));
        }
        Ok(next)
    }

    /// APPEND/PREPEND (§4.B): atomic read-modify-write under the key's
    /// lock. Missing/tombstoned values start from "". Result capped at
    /// 256 KiB, else `PayloadTooLarge`.
    pub async fn concat(
        &self,
        key: &str,
        piece: &str,
        prepend: bool,
        version: Version,
    ) -> Result<String, Error> {
        let lock = self.key_locks.get(key);
        let _guard = lock.lock().await;

        let current = match self.current(key) {
            Some(e) if !e.tombstone => e.value.unwrap_or_default(),
            _ => String::new(),
        };
        let next = if prepend {
            format!("{piece}{current}")
        } else {
            format!("{current}{piece}")
        };
        if next.len() > MAX_VALUE_BYTES {
            return Err(Error::PayloadTooLarge {
                actual: next.len(),
                limit: MAX_VALUE_BYTES,
            });
        }

        let sequence = self.next_sequence();
        let applied = self.commit(key, VersionedEntry::live(next.clone(), version, sequence));
        if !applied {
            return Err(Error::Internal(format!(
                "write to '{key}' lost to a concurrent version"
            )));
        }
        Ok(next)
    }

    /// `gcTombstones(now) → count` (§4.B): drop tombstones older than
    /// `retention_hours`. Read-only-ish from the caller's perspective but
    /// mutates the map, so it still takes the write lock.
    pub fn gc_tombstones(&self, now_ms: u64, retention_hours: u64) -> usize {
        let retention_ms = retention_hours.saturating_mul(3_600_000);
        let mut entries = self.entries.write().expect("store poisoned");
        let mut merkle = self.merkle.lock().expect("merkle lock poisoned");
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| {
                e.tombstone
                    && now_ms.saturating_sub(e.version.timestamp_ms) > retention_ms
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            merkle.remove(key);
        }
        expired.len()
    }

    pub fn merkle_root(&self) -> Option<Vec<u8>> {
        self.merkle
            .lock()
            .expect("merkle lock poisoned")
            .root_hash()
            .map(|h| h.to_vec())
    }

    pub fn merkle_chunks(&self, chunk_size: usize) -> Vec<Vec<(String, Vec<u8>)>> {
        self.merkle
            .lock()
            .expect("merkle lock poisoned")
            .chunked_leaves(chunk_size)
    }

    /// Keys whose leaf hash disagrees with (or is absent from) `other`,
    /// for anti-entropy reconciliation (§4.H).
    pub fn merkle_diff(&self, other: &HashMap<String, Vec<u8>>) -> Vec<String> {
        self.merkle.lock().expect("merkle lock poisoned").diff_keys(other)
    }

    pub fn entry(&self, key: &str) -> Option<VersionedEntry> {
        self.current(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every `(key, entry)` pair, used by journal compaction.
    pub fn snapshot(&self) -> Vec<(String, VersionedEntry)> {
        self.entries
            .read()
            .expect("store poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = VersionedStore::new();
        store
            .put("k1", "v1".to_string(), Version::new(100, "n1"))
            .unwrap();
        assert_eq!(store.get("k1"), Some("v1".to_string()));
    }

    #[test]
    fn stale_version_is_discarded() {
        let store = VersionedStore::new();
        store
            .put("k1", "v1".to_string(), Version::new(200, "n1"))
            .unwrap();
        let applied = store
            .put("k1", "stale".to_string(), Version::new(100, "n1"))
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get("k1"), Some("v1".to_string()));
    }

    #[test]
    fn delete_creates_tombstone_hidden_from_get() {
        let store = VersionedStore::new();
        store
            .put("k1", "v1".to_string(), Version::new(100, "n1"))
            .unwrap();
        store.delete("k1", Version::new(200, "n1"));
        assert_eq!(store.get("k1"), None);
        assert!(store.entry("k1").unwrap().tombstone);
    }

    #[test]
    fn gc_removes_only_expired_tombstones() {
        let store = VersionedStore::new();
        store.delete("old", Version::new(0, "n1"));
        store.delete("new", Version::new(1_000_000, "n1"));
        let removed = store.gc_tombstones(100_000_000, 1);
        assert_eq!(removed, 1);
        assert!(store.entry("old").is_none());
        assert!(store.entry("new").is_some());
    }

    #[tokio::test]
    async fn concurrent_incr_on_same_key_serializes() {
        let store = Arc::new(VersionedStore::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .add("counter", 1, Version::new(i, "n1"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("counter"), Some("20".to_string()));
    }

    #[tokio::test]
    async fn incr_on_missing_key_starts_from_zero() {
        let store = VersionedStore::new();
        let result = store.add("missing", 5, Version::new(1, "n1")).await.unwrap();
        assert_eq!(result, 5);
    }

    #[tokio::test]
    async fn incr_on_non_numeric_value_is_invalid_type() {
        let store = VersionedStore::new();
        store
            .put("k1", "not a number".to_string(), Version::new(1, "n1"))
            .unwrap();
        let result = store.add("k1", 1, Version::new(2, "n1")).await;
        assert!(matches!(result, Err(Error::InvalidType { .. })));
    }

    #[tokio::test]
    async fn append_over_limit_is_payload_too_large() {
        let store = VersionedStore::new();
        let big = "x".repeat(MAX_VALUE_BYTES);
        store.put("k1", big, Version::new(1, "n1")).unwrap();
        let result = store
            .concat("k1", "y", false, Version::new(2, "n1"))
            .await;
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn apply_remote_follows_same_merge_rule_as_local_write() {
        let store = VersionedStore::new();
        store
            .put("k1", "local".to_string(), Version::new(100, "n1"))
            .unwrap();
        let remote = VersionedEntry::live("remote".to_string(), Version::new(50, "n2"), 0);
        let applied = store.apply_remote("k1", remote);
        assert!(!applied);
        assert_eq!(store.get("k1"), Some("local".to_string()));
    }
}
