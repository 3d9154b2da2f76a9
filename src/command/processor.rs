//! # Command Processor
//!
//! Parses a [`CommandEnvelope`](crate::model::CommandEnvelope), validates it
//! against §3's size/charset rules, dispatches to the storage engine, and
//! builds a [`ResponseEnvelope`](crate::model::ResponseEnvelope) (§4.F).
//! Transport-agnostic: the processor never touches MQTT, it just turns one
//! envelope into another. Generalizes the teacher's `protocol.rs`
//! `Command` enum and `server.rs`'s dispatch-by-match-arm structure to the
//! JSON envelope/LWW-versioned world this crate replaces the text protocol
//! with.
//!
//! Idempotency (§4.F): every command carries an `id`; a retry with a known
//! id returns the cached response without re-executing, via
//! [`IdempotencyCache`].

use crate::command::idempotency::IdempotencyCache;
use crate::error::Error;
use crate::model::{
    validate_node_id, validate_value, CommandEnvelope, Key, Op, ReplicationEvent, ResponseEnvelope,
    Version, MAX_COMMAND_BYTES,
};
use crate::replication::Outbox;
use crate::store::VersionedStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock milliseconds, abstracted so tests can supply a
/// deterministic clock instead of `SystemTime::now()`.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the OS wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Dispatches validated commands to the storage engine and caches completed
/// responses by command id for idempotent retries.
pub struct Processor {
    store: std::sync::Arc<VersionedStore>,
    node_id: String,
    clock: Box<dyn Clock>,
    cache: Mutex<IdempotencyCache>,
    local_sequence: AtomicU64,
    last_issued_ms: AtomicU64,
    outbox: Mutex<Option<Arc<Outbox>>>,
}

impl Processor {
    pub fn new(store: std::sync::Arc<VersionedStore>, node_id: impl Into<String>) -> Self {
        Self::with_clock(store, node_id, Box::new(SystemClock))
    }

    pub fn with_clock(
        store: std::sync::Arc<VersionedStore>,
        node_id: impl Into<String>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            clock,
            cache: Mutex::new(IdempotencyCache::with_default_capacity()),
            local_sequence: AtomicU64::new(0),
            last_issued_ms: AtomicU64::new(0),
            outbox: Mutex::new(None),
        }
    }

    /// Wire the replication outbox in after construction, once `Node` has
    /// built both. Every successful mutation dispatched after this point
    /// is also enqueued for replication (§4.H); before it's set, mutations
    /// apply locally with no replication (used by the standalone unit
    /// tests in this module).
    pub fn set_outbox(&self, outbox: Arc<Outbox>) {
        *self.outbox.lock().expect("outbox slot poisoned") = Some(outbox);
    }

    /// Issue this node's next version. The wall clock alone isn't enough:
    /// two writes within the same millisecond would otherwise produce an
    /// identical (ts, node_id) pair, and the second `commit` would discard
    /// the write under LWW while the caller is told it succeeded. Tracking
    /// the last-issued timestamp and bumping past it keeps local issuance
    /// strictly increasing per node, so every local write this processor
    /// makes is guaranteed to supersede the one before it.
    fn next_version(&self) -> Version {
        let mut prev = self.last_issued_ms.load(Ordering::SeqCst);
        loop {
            let now = self.clock.now_ms();
            let candidate = now.max(prev.saturating_add(1));
            match self.last_issued_ms.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Version::new(candidate, self.node_id.clone()),
                Err(actual) => prev = actual,
            }
        }
    }

    fn next_local_sequence(&self) -> u64 {
        self.local_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a replication event for a just-applied local mutation
    /// (§4.H). A no-op until `set_outbox` has been called.
    async fn replicate(&self, key: &str, value: Option<String>, version: &Version, tombstone: bool) {
        let outbox = self.outbox.lock().expect("outbox slot poisoned").clone();
        if let Some(outbox) = outbox {
            let sequence = self.next_local_sequence();
            let event = ReplicationEvent::new(key, value, version, sequence, tombstone);
            if let Err(err) = outbox.enqueue(event).await {
                log::warn!("failed to enqueue replication event for key '{key}': {err}");
            }
        }
    }

    /// Process one command envelope, returning its response. Idempotent:
    /// a second call with the same `id` returns the cached response
    /// without touching storage again (§4.F, §8).
    pub async fn process(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        if let Some(cached) = self.cache.lock().expect("idempotency cache poisoned").get(&envelope.id) {
            return cached;
        }

        let response = match self.dispatch(&envelope).await {
            Ok(response) => response,
            Err(err) => ResponseEnvelope::err(envelope.id.clone(), &err),
        };

        self.cache
            .lock()
            .expect("idempotency cache poisoned")
            .insert(envelope.id.clone(), response.clone());
        response
    }

    async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<ResponseEnvelope, Error> {
        validate_envelope_size(envelope)?;

        match envelope.op {
            Op::Get => {
                let key = required_key(envelope)?;
                let value = self.store.get(key.as_str());
                Ok(ResponseEnvelope::ok(
                    &envelope.id,
                    Some(match value {
                        Some(v) => serde_json::Value::String(v),
                        None => serde_json::Value::Null,
                    }),
                ))
            }
            Op::Set => {
                let key = required_key(envelope)?;
                let value = required_value(envelope)?;
                validate_value(&value).map_err(|reason| Error::Validation {
                    field: "value",
                    value: value.clone(),
                    reason,
                })?;
                let version = self.next_version();
                let applied = self.store.put(key.as_str(), value.clone(), version.clone())?;
                if !applied {
                    return Err(Error::Internal(format!(
                        "write to '{}' lost to a concurrent version",
                        key.as_str()
                    )));
                }
                self.replicate(key.as_str(), Some(value), &version, false).await;
                Ok(ResponseEnvelope::ok(&envelope.id, None))
            }
            Op::Delete => {
                let key = required_key(envelope)?;
                let version = self.next_version();
                let applied = self.store.delete(key.as_str(), version.clone());
                if applied {
                    self.replicate(key.as_str(), None, &version, true).await;
                }
                Ok(ResponseEnvelope::ok(&envelope.id, None))
            }
            Op::Incr | Op::Decr => {
                let key = required_key(envelope)?;
                let magnitude = envelope.amount.unwrap_or(1);
                let delta = if matches!(envelope.op, Op::Decr) {
                    -magnitude
                } else {
                    magnitude
                };
                let version = self.next_version();
                let result = self
                    .store
                    .add(key.as_str(), delta, version.clone())
                    .await?;
                self.replicate(key.as_str(), Some(result.to_string()), &version, false)
                    .await;
                Ok(ResponseEnvelope::ok(
                    &envelope.id,
                    Some(serde_json::Value::Number(result.into())),
                ))
            }
            Op::Append | Op::Prepend => {
                let key = required_key(envelope)?;
                let value = required_value(envelope)?;
                let prepend = matches!(envelope.op, Op::Prepend);
                let version = self.next_version();
                let result = self
                    .store
                    .concat(key.as_str(), &value, prepend, version.clone())
                    .await?;
                self.replicate(key.as_str(), Some(result.clone()), &version, false)
                    .await;
                Ok(ResponseEnvelope::ok(
                    &envelope.id,
                    Some(serde_json::Value::Number(result.len().into())),
                ))
            }
            Op::Mget => {
                let keys = envelope.keys.as_ref().ok_or_else(|| Error::Validation {
                    field: "keys",
                    value: String::new(),
                    reason: "MGET requires a non-empty keys array".to_string(),
                })?;
                let mut results = serde_json::Map::new();
                for raw_key in keys {
                    let key = Key::new(raw_key.clone()).map_err(|reason| Error::Validation {
                        field: "keys[]",
                        value: raw_key.clone(),
                        reason,
                    })?;
                    let value = self.store.get(key.as_str());
                    results.insert(
                        key.into_string(),
                        match value {
                            Some(v) => serde_json::Value::String(v),
                            None => serde_json::Value::Null,
                        },
                    );
                }
                Ok(ResponseEnvelope::ok_results(
                    &envelope.id,
                    serde_json::Value::Object(results),
                ))
            }
            Op::Mset => {
                let kv = envelope.kv.as_ref().ok_or_else(|| Error::Validation {
                    field: "kv",
                    value: String::new(),
                    reason: "MSET requires a non-empty kv map".to_string(),
                })?;
                let mut results = serde_json::Map::new();
                for (raw_key, value) in kv {
                    let outcome = self.set_one(raw_key, value).await;
                    results.insert(raw_key.clone(), serde_json::Value::Bool(outcome.is_ok()));
                    if let Err(err) = outcome {
                        log::warn!("MSET key '{raw_key}' failed: {err}");
                    }
                }
                Ok(ResponseEnvelope::ok_results(
                    &envelope.id,
                    serde_json::Value::Object(results),
                ))
            }
        }
    }

    async fn set_one(&self, raw_key: &str, value: &str) -> Result<(), Error> {
        let key = Key::new(raw_key).map_err(|reason| Error::Validation {
            field: "kv{}",
            value: raw_key.to_string(),
            reason,
        })?;
        validate_value(value).map_err(|reason| Error::Validation {
            field: "kv{}",
            value: raw_key.to_string(),
            reason,
        })?;
        let version = self.next_version();
        let applied = self
            .store
            .put(key.as_str(), value.to_string(), version.clone())?;
        if !applied {
            return Err(Error::Internal(format!(
                "write to '{}' lost to a concurrent version",
                key.as_str()
            )));
        }
        self.replicate(key.as_str(), Some(value.to_string()), &version, false)
            .await;
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

fn required_key(envelope: &CommandEnvelope) -> Result<Key, Error> {
    let raw = envelope.key.as_deref().ok_or_else(|| Error::Validation {
        field: "key",
        value: String::new(),
        reason: "op requires a key".to_string(),
    })?;
    Key::new(raw).map_err(|reason| Error::Validation {
        field: "key",
        value: raw.to_string(),
        reason,
    })
}

fn required_value(envelope: &CommandEnvelope) -> Result<String, Error> {
    envelope.value.clone().ok_or_else(|| Error::Validation {
        field: "value",
        value: String::new(),
        reason: "op requires a value".to_string(),
    })
}

/// Enforce the §3/§8 "before any network I/O" boundary: a command payload
/// larger than 512 KiB is rejected from its approximate encoded size,
/// before storage is ever touched.
fn validate_envelope_size(envelope: &CommandEnvelope) -> Result<(), Error> {
    let approx = serde_json::to_vec(envelope).map_err(|e| Error::Internal(e.to_string()))?;
    if approx.len() > MAX_COMMAND_BYTES {
        return Err(Error::PayloadTooLarge {
            actual: approx.len(),
            limit: MAX_COMMAND_BYTES,
        });
    }
    Ok(())
}

/// Validate a would-be node id at config time, re-exported here because the
/// processor and config module both enforce the same charset rule.
pub fn validate_processor_node_id(node_id: &str) -> Result<(), Error> {
    validate_node_id(node_id).map_err(|reason| Error::Validation {
        field: "node_id",
        value: node_id.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseStatus;
    use std::sync::Arc;

    struct FixedClock(std::sync::atomic::AtomicU64);
    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0.fetch_add(1, Ordering::Relaxed)
        }
    }

    fn processor() -> Processor {
        Processor::with_clock(
            Arc::new(VersionedStore::new()),
            "node-a",
            Box::new(FixedClock(std::sync::atomic::AtomicU64::new(100))),
        )
    }

    fn cmd(id: &str, op: Op) -> CommandEnvelope {
        CommandEnvelope {
            id: id.to_string(),
            op,
            key: None,
            value: None,
            amount: None,
            keys: None,
            kv: None,
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let p = processor();
        let mut set = cmd("c1", Op::Set);
        set.key = Some("k1".to_string());
        set.value = Some("v1".to_string());
        let resp = p.process(set).await;
        assert_eq!(resp.status, ResponseStatus::Ok);

        let mut get = cmd("c2", Op::Get);
        get.key = Some("k1".to_string());
        let resp = p.process(get).await;
        assert_eq!(resp.value, Some(serde_json::Value::String("v1".into())));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_absent_key_is_ok() {
        let p = processor();
        let mut del = cmd("d1", Op::Delete);
        del.key = Some("missing".to_string());
        let first = p.process(del.clone()).await;
        assert_eq!(first.status, ResponseStatus::Ok);
        let second = p.process(del).await;
        assert_eq!(second.status, ResponseStatus::Ok);

        let mut get = cmd("g1", Op::Get);
        get.key = Some("missing".to_string());
        let resp = p.process(get).await;
        assert_eq!(resp.value, Some(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn retry_with_same_id_returns_cached_response_without_reexecuting() {
        let p = processor();
        let mut set1 = cmd("r1", Op::Set);
        set1.key = Some("x".to_string());
        set1.value = Some("a".to_string());
        p.process(set1).await;

        let mut set2 = cmd("r1", Op::Set);
        set2.key = Some("x".to_string());
        set2.value = Some("b".to_string());
        p.process(set2).await;

        let mut get = cmd("g1", Op::Get);
        get.key = Some("x".to_string());
        let resp = p.process(get).await;
        assert_eq!(resp.value, Some(serde_json::Value::String("a".into())));
    }

    #[tokio::test]
    async fn incr_defaults_amount_to_one() {
        let p = processor();
        let mut incr = cmd("i1", Op::Incr);
        incr.key = Some("counter".to_string());
        let resp = p.process(incr).await;
        assert_eq!(resp.value, Some(serde_json::Value::Number(1.into())));
    }

    #[tokio::test]
    async fn mget_returns_map_with_nulls_for_missing() {
        let p = processor();
        let mut set = cmd("s1", Op::Set);
        set.key = Some("a".to_string());
        set.value = Some("1".to_string());
        p.process(set).await;

        let mut mget = cmd("m1", Op::Mget);
        mget.keys = Some(vec!["a".to_string(), "b".to_string()]);
        let resp = p.process(mget).await;
        let results = resp.results.unwrap();
        assert_eq!(results["a"], serde_json::Value::String("1".into()));
        assert_eq!(results["b"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn mset_reports_per_key_success() {
        let p = processor();
        let mut kv = BTreeMap::new();
        kv.insert("a".to_string(), "1".to_string());
        kv.insert("b".to_string(), "2".to_string());
        let mut mset = cmd("ms1", Op::Mset);
        mset.kv = Some(kv);
        let resp = p.process(mset).await;
        let results = resp.results.unwrap();
        assert_eq!(results["a"], serde_json::Value::Bool(true));
        assert_eq!(results["b"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn get_without_key_is_validation_error() {
        let p = processor();
        let resp = p.process(cmd("bad", Op::Get)).await;
        assert_eq!(resp.status, ResponseStatus::Err);
        assert_eq!(resp.code, Some(100));
    }
}
