//! # Data Model
//!
//! Canonical types shared across the storage engine, codec, command
//! processor, and replication pipeline: `VersionedEntry` (the LWW unit of
//! truth), `ReplicationEvent` (the wire form replicated between peers), and
//! the command/response envelopes exchanged over the command/response MQTT
//! topics.
//!
//! Size and charset limits are declared once here as associated constants so
//! validators, the codec, and the command processor can't drift apart.

use serde::{Deserialize, Serialize};

/// Maximum key size in UTF-8 bytes.
pub const MAX_KEY_BYTES: usize = 256;
/// Maximum value size in UTF-8 bytes (256 KiB).
pub const MAX_VALUE_BYTES: usize = 262_144;
/// Maximum serialized `CommandEnvelope` size in bytes (512 KiB).
pub const MAX_COMMAND_BYTES: usize = 524_288;
/// Maximum serialized `ReplicationEvent` size in bytes (300 KiB).
pub const MAX_REPLICATION_BYTES: usize = 307_200;
/// Default acceptable future clock skew for inbound replication events.
pub const DEFAULT_SKEW_MAX_FUTURE_MS: u64 = 300_000;
/// Default tombstone retention window.
pub const DEFAULT_TOMBSTONE_RETENTION_HOURS: u64 = 24;

/// A validated key. Construction is the only place key charset/size rules
/// are enforced; once built, a `Key` is known-valid everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// Validate and wrap a raw string as a `Key`.
    ///
    /// Rules (§3): 1-256 UTF-8 bytes, no NUL, no `/`, `+`, `#`.
    pub fn new(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        let len = raw.len();
        if len == 0 || len > MAX_KEY_BYTES {
            return Err(format!(
                "key must be 1-{} bytes, got {}",
                MAX_KEY_BYTES, len
            ));
        }
        if raw.bytes().any(|b| b == 0) {
            return Err("key must not contain NUL".to_string());
        }
        if raw.contains('/') || raw.contains('+') || raw.contains('#') {
            return Err("key must not contain '/', '+', or '#'".to_string());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a value string against §3's size rule (0-262,144 UTF-8 bytes).
pub fn validate_value(value: &str) -> Result<(), String> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(format!(
            "value must be at most {} bytes, got {}",
            MAX_VALUE_BYTES,
            value.len()
        ));
    }
    Ok(())
}

/// Validate a node id: 1-128 chars, `[A-Za-z0-9_-]`.
pub fn validate_node_id(node_id: &str) -> Result<(), String> {
    let len = node_id.len();
    if len == 0 || len > 128 {
        return Err(format!("node id must be 1-128 chars, got {}", len));
    }
    if !node_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err("node id must match [A-Za-z0-9_-]".to_string());
    }
    Ok(())
}

/// A hybrid `(timestampMs, nodeId)` version used for LWW ordering.
///
/// `E1` replaces `E2` iff `(E1.ts, E1.node) > (E2.ts, E2.node)`
/// lexicographically: timestamp first, node id as a tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub timestamp_ms: u64,
    pub node_id: String,
}

impl Version {
    pub fn new(timestamp_ms: u64, node_id: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            node_id: node_id.into(),
        }
    }
}

/// The versioned entry stored per live key. Absence of `value` means the
/// entry is a tombstone (deletion marker), with `deleted_at` recording the
/// tombstone's timestamp for retention accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub value: Option<String>,
    pub version: Version,
    /// Monotonic per-node counter. Carried for debugging only; ordering
    /// is decided entirely by `version`, never by `sequence`.
    pub sequence: u64,
    pub tombstone: bool,
}

impl VersionedEntry {
    pub fn live(value: String, version: Version, sequence: u64) -> Self {
        Self {
            value: Some(value),
            version,
            sequence,
            tombstone: false,
        }
    }

    pub fn tombstone(version: Version, sequence: u64) -> Self {
        Self {
            value: None,
            version,
            sequence,
            tombstone: true,
        }
    }

    /// `deletedAt` is only meaningful for tombstones; it's the version's
    /// own timestamp (§3).
    pub fn deleted_at_ms(&self) -> Option<u64> {
        self.tombstone.then_some(self.version.timestamp_ms)
    }

    /// LWW comparison: does `self` replace `other`?
    pub fn supersedes(&self, other: &VersionedEntry) -> bool {
        self.version > other.version
    }
}

/// The kind of mutation a `ReplicationEvent` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Set,
    Delete,
    Incr,
    Decr,
    Append,
    Prepend,
}

/// The canonical CBOR-encoded replication message, `{k,v,ts,node,seq,del}`.
///
/// For numeric/string ops the event carries the *resulting* value (after
/// the op is applied), exactly as a SET would: this keeps remote apply
/// trivial and LWW-correct: the winner simply becomes "the value" (the
/// same design the teacher's `ChangeEvent` doc comments describe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "v")]
    pub value: Option<String>,
    #[serde(rename = "ts")]
    pub timestamp_ms: u64,
    #[serde(rename = "node")]
    pub node_id: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(rename = "del")]
    pub tombstone: bool,
}

impl ReplicationEvent {
    pub fn new(
        key: impl Into<String>,
        value: Option<String>,
        version: &Version,
        sequence: u64,
        tombstone: bool,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp_ms: version.timestamp_ms,
            node_id: version.node_id.clone(),
            sequence,
            tombstone,
        }
    }

    pub fn version(&self) -> Version {
        Version::new(self.timestamp_ms, self.node_id.clone())
    }

    pub fn to_entry(&self) -> VersionedEntry {
        if self.tombstone {
            VersionedEntry::tombstone(self.version(), self.sequence)
        } else {
            VersionedEntry::live(
                self.value.clone().unwrap_or_default(),
                self.version(),
                self.sequence,
            )
        }
    }
}

/// Commands a peer may issue over its command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Get,
    Set,
    #[serde(rename = "DEL")]
    Delete,
    Incr,
    Decr,
    Append,
    Prepend,
    Mget,
    Mset,
}

/// The JSON command payload (§3/§6). Field presence depends on `op`:
/// GET/DELETE use `key`; SET/APPEND/PREPEND use `key`+`value`;
/// INCR/DECR use `key`+optional `amount`; MGET uses `keys`; MSET uses `kv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv: Option<std::collections::BTreeMap<String, String>>,
}

/// The JSON response payload (§3/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl ResponseEnvelope {
    pub fn ok(id: impl Into<String>, value: Option<serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            value,
            results: None,
            error: None,
            code: None,
        }
    }

    pub fn ok_results(id: impl Into<String>, results: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            value: None,
            results: Some(results),
            error: None,
            code: None,
        }
    }

    pub fn err(id: impl Into<String>, error: &crate::error::Error) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Err,
            value: None,
            results: None,
            error: Some(error.to_string()),
            code: Some(error.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Ok,
    Err,
}

/// Relative priority of a queued offline operation. `Ord` is derived in
/// declaration order (`High < Normal < Low`) so callers wanting
/// "High first" should compare in reverse; `OfflineQueue` sorts
/// descending explicitly rather than relying on derive order semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// A command buffered while the broker client is not `Connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub op_id: String,
    pub op_type: Op,
    pub priority: Priority,
    pub payload: CommandEnvelope,
    pub queued_at_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rejects_wildcards_and_separators() {
        assert!(Key::new("a/b").is_err());
        assert!(Key::new("a+b").is_err());
        assert!(Key::new("a#b").is_err());
        assert!(Key::new("").is_err());
        assert!(Key::new("a".repeat(257)).is_err());
        assert!(Key::new("user:123").is_ok());
    }

    #[test]
    fn value_boundary_262145_rejected() {
        let ok = "x".repeat(MAX_VALUE_BYTES);
        assert!(validate_value(&ok).is_ok());
        let bad = "x".repeat(MAX_VALUE_BYTES + 1);
        assert!(validate_value(&bad).is_err());
    }

    #[test]
    fn lww_ordering_is_ts_then_node() {
        let a = VersionedEntry::live("v1".into(), Version::new(100, "aaa"), 1);
        let b = VersionedEntry::live("v2".into(), Version::new(200, "aaa"), 1);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));

        let tie_a = VersionedEntry::live("A".into(), Version::new(150, "aaa"), 1);
        let tie_b = VersionedEntry::live("B".into(), Version::new(150, "bbb"), 1);
        assert!(tie_b.supersedes(&tie_a));
        assert!(!tie_a.supersedes(&tie_b));
    }

    #[test]
    fn priority_order_high_greatest() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
