//! # Replication Applier (§4.H)
//!
//! Applies inbound replication events to the storage engine under LWW,
//! after three rejection checks: oversized payload, future clock skew,
//! and self-echo (a node must never apply its own published event back
//! to itself). No ACK is ever emitted for an applied event.

use crate::codec;
use crate::model::MAX_REPLICATION_BYTES;
use crate::store::VersionedStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooLarge,
    FutureSkew,
    SelfEcho,
    DecodeError,
}

#[derive(Debug, Default)]
pub struct ApplierMetrics {
    pub events_applied: AtomicU64,
    pub events_rejected_too_large: AtomicU64,
    pub events_rejected_future_skew: AtomicU64,
    pub events_rejected_self_echo: AtomicU64,
    pub events_rejected_decode_error: AtomicU64,
}

pub struct Applier {
    store: Arc<VersionedStore>,
    self_node_id: String,
    skew_max_future_ms: u64,
    metrics: Arc<ApplierMetrics>,
    last_activity_ms: AtomicU64,
}

impl Applier {
    pub fn new(store: Arc<VersionedStore>, self_node_id: impl Into<String>, skew_max_future_ms: u64) -> Self {
        Self {
            store,
            self_node_id: self_node_id.into(),
            skew_max_future_ms,
            metrics: Arc::new(ApplierMetrics::default()),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> Arc<ApplierMetrics> {
        self.metrics.clone()
    }

    /// Timestamp of the last replication event this node successfully
    /// applied or anti-entropy sync it completed, used to compute the
    /// extended tombstone-retention window (§9's resurrection policy).
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn note_activity(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Apply one inbound CBOR-encoded event, enforcing §4.H's three
    /// rejection checks before ever touching storage.
    pub fn apply_bytes(&self, bytes: &[u8], now_ms: u64) -> Result<bool, RejectReason> {
        if bytes.len() > MAX_REPLICATION_BYTES {
            self.metrics.events_rejected_too_large.fetch_add(1, Ordering::Relaxed);
            return Err(RejectReason::TooLarge);
        }

        let event = codec::decode_event(bytes).map_err(|err| {
            log::warn!("rejecting malformed replication event: {err}");
            self.metrics.events_rejected_decode_error.fetch_add(1, Ordering::Relaxed);
            RejectReason::DecodeError
        })?;

        if event.node_id == self.self_node_id {
            self.metrics.events_rejected_self_echo.fetch_add(1, Ordering::Relaxed);
            return Err(RejectReason::SelfEcho);
        }

        if event.timestamp_ms > now_ms.saturating_add(self.skew_max_future_ms) {
            self.metrics.events_rejected_future_skew.fetch_add(1, Ordering::Relaxed);
            return Err(RejectReason::FutureSkew);
        }

        let applied = self.store.apply_remote(&event.key, event.to_entry());
        self.metrics.events_applied.fetch_add(1, Ordering::Relaxed);
        self.note_activity(now_ms);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Version;

    fn applier() -> Applier {
        Applier::new(Arc::new(VersionedStore::new()), "self-node", 300_000)
    }

    #[test]
    fn applies_event_from_remote_node_under_lww() {
        let a = applier();
        let event = crate::model::ReplicationEvent::new(
            "k1",
            Some("v1".to_string()),
            &Version::new(1000, "other-node"),
            1,
            false,
        );
        let bytes = codec::encode_event(&event).unwrap();
        let applied = a.apply_bytes(&bytes, 2000).unwrap();
        assert!(applied);
        assert_eq!(a.store.get("k1"), Some("v1".to_string()));
    }

    #[test]
    fn rejects_self_echo() {
        let a = applier();
        let event = crate::model::ReplicationEvent::new(
            "k1",
            Some("v1".to_string()),
            &Version::new(1000, "self-node"),
            1,
            false,
        );
        let bytes = codec::encode_event(&event).unwrap();
        let result = a.apply_bytes(&bytes, 2000);
        assert_eq!(result, Err(RejectReason::SelfEcho));
        assert_eq!(a.store.get("k1"), None);
    }

    #[test]
    fn rejects_future_skew_beyond_max() {
        let a = applier();
        let event = crate::model::ReplicationEvent::new(
            "k1",
            Some("v1".to_string()),
            &Version::new(10_000_000, "other-node"),
            1,
            false,
        );
        let bytes = codec::encode_event(&event).unwrap();
        let result = a.apply_bytes(&bytes, 1000);
        assert_eq!(result, Err(RejectReason::FutureSkew));
    }

    #[test]
    fn rejects_oversized_payload_before_decode() {
        let a = applier();
        let big = vec![0u8; MAX_REPLICATION_BYTES + 1];
        let result = a.apply_bytes(&big, 0);
        assert_eq!(result, Err(RejectReason::TooLarge));
    }

    #[test]
    fn double_apply_of_same_event_is_idempotent() {
        let a = applier();
        let event = crate::model::ReplicationEvent::new(
            "k1",
            Some("v1".to_string()),
            &Version::new(1000, "other-node"),
            1,
            false,
        );
        let bytes = codec::encode_event(&event).unwrap();
        assert!(a.apply_bytes(&bytes, 2000).unwrap());
        assert!(!a.apply_bytes(&bytes, 2000).unwrap());
        assert_eq!(a.store.get("k1"), Some("v1".to_string()));
    }
}
