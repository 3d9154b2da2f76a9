//! # Deterministic CBOR Codec
//!
//! Encodes `ReplicationEvent`s to canonical CBOR (RFC 7049 §3.9 ordering:
//! map keys sorted by byte length, then lexicographically) and decodes with
//! strict rejection of trailing bytes and unknown top-level fields.
//!
//! `serde_cbor` already emits integers in shortest form and definite-length
//! containers, so the only thing this module adds on top of a plain
//! `serde_cbor::to_vec`/`from_slice` round-trip is canonical map-key
//! ordering on encode and strictness on decode.

use crate::model::{ReplicationEvent, MAX_REPLICATION_BYTES};
use serde::Serialize;
use serde_cbor::Value;
use std::collections::BTreeMap;

/// The exact set of top-level keys a valid `ReplicationEvent` may carry.
const REPLICATION_EVENT_KEYS: &[&str] = &["k", "v", "ts", "node", "seq", "del"];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cbor encode failed: {0}")]
    Encode(String),
    #[error("cbor decode failed: {0}")]
    Decode(String),
    #[error("trailing bytes after decoding one CBOR value")]
    TrailingBytes,
    #[error("unknown field '{0}' in replication event")]
    UnknownField(String),
    #[error("missing field '{0}' in replication event")]
    MissingField(&'static str),
    #[error("encoded payload of {actual} bytes exceeds {limit} byte cap")]
    TooLarge { actual: usize, limit: usize },
}

/// Encode a `ReplicationEvent` to canonical CBOR, enforcing the 300 KiB cap.
pub fn encode_event(event: &ReplicationEvent) -> Result<Vec<u8>, CodecError> {
    let bytes = encode_canonical(event)?;
    if bytes.len() > MAX_REPLICATION_BYTES {
        return Err(CodecError::TooLarge {
            actual: bytes.len(),
            limit: MAX_REPLICATION_BYTES,
        });
    }
    Ok(bytes)
}

/// Decode a `ReplicationEvent` from CBOR bytes, rejecting trailing bytes and
/// any top-level key outside the canonical field set.
pub fn decode_event(bytes: &[u8]) -> Result<ReplicationEvent, CodecError> {
    if bytes.len() > MAX_REPLICATION_BYTES {
        return Err(CodecError::TooLarge {
            actual: bytes.len(),
            limit: MAX_REPLICATION_BYTES,
        });
    }
    let value = decode_single_value(bytes)?;
    let map = match &value {
        Value::Map(m) => m,
        other => {
            return Err(CodecError::Decode(format!(
                "expected a CBOR map, got {:?}",
                other
            )))
        }
    };
    for key in map.keys() {
        let Value::Text(k) = key else {
            return Err(CodecError::Decode("non-string map key".to_string()));
        };
        if !REPLICATION_EVENT_KEYS.contains(&k.as_str()) {
            return Err(CodecError::UnknownField(k.clone()));
        }
    }
    serde_cbor::value::from_value(value.clone())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Serialize any `Serialize` value to canonical CBOR (sorted map keys).
/// Exposed for types beyond `ReplicationEvent` that want the same ordering
/// guarantee (e.g. anti-entropy chunk payloads).
///
/// `serde_cbor::Value::Map` is backed by a `BTreeMap<Value, Value>`, which
/// would silently re-sort entries by `Value`'s own `Ord` (plain lexicographic
/// on text) rather than the RFC 7049 canonical order. So this writes map and
/// array headers by hand and lets `serde_cbor` encode only the leaves.
pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let as_value =
        serde_cbor::value::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(canonical_bytes(&as_value))
}

fn canonical_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Map(map) => {
            let mut entries: Vec<(Vec<u8>, Vec<u8>)> = map
                .iter()
                .map(|(k, v)| (cbor_key_bytes(k), canonical_bytes(v)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| (a.len(), a).cmp(&(b.len(), b)));
            let mut out = cbor_header(5, entries.len() as u64);
            for (k, v) in entries {
                out.extend(k);
                out.extend(v);
            }
            out
        }
        Value::Array(items) => {
            let mut out = cbor_header(4, items.len() as u64);
            for item in items {
                out.extend(canonical_bytes(item));
            }
            out
        }
        other => serde_cbor::to_vec(other).unwrap_or_default(),
    }
}

/// Encode a definite-length CBOR major-type/argument header (RFC 7049 §2.1),
/// always in the shortest form that fits `len`.
fn cbor_header(major: u8, len: u64) -> Vec<u8> {
    let major_bits = major << 5;
    if len < 24 {
        vec![major_bits | len as u8]
    } else if len <= u8::MAX as u64 {
        vec![major_bits | 24, len as u8]
    } else if len <= u16::MAX as u64 {
        let mut out = vec![major_bits | 25];
        out.extend((len as u16).to_be_bytes());
        out
    } else if len <= u32::MAX as u64 {
        let mut out = vec![major_bits | 26];
        out.extend((len as u32).to_be_bytes());
        out
    } else {
        let mut out = vec![major_bits | 27];
        out.extend(len.to_be_bytes());
        out
    }
}

fn cbor_key_bytes(value: &Value) -> Vec<u8> {
    // Keys are serialized whole (header included) so sorting on the encoded
    // bytes matches RFC 7049's "compare the encodings" canonical rule.
    serde_cbor::to_vec(value).unwrap_or_default()
}

fn decode_single_value(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut de = serde_cbor::Deserializer::from_slice(bytes);
    let value: Value = serde::Deserialize::deserialize(&mut de)
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if de.byte_offset() != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Version;

    fn sample() -> ReplicationEvent {
        ReplicationEvent::new(
            "k1",
            Some("v1".to_string()),
            &Version::new(1000, "nodeA"),
            7,
            false,
        )
    }

    #[test]
    fn encode_decode_round_trip_is_identity() {
        let ev = sample();
        let bytes = encode_event(&ev).unwrap();
        let back = decode_event(&bytes).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let ev = sample();
        let mut bytes = encode_event(&ev).unwrap();
        bytes.push(0xFF);
        assert!(matches!(
            decode_event(&bytes),
            Err(CodecError::TrailingBytes)
        ));
    }

    #[test]
    fn decode_rejects_unknown_field() {
        let mut map = BTreeMap::new();
        map.insert(Value::Text("k".into()), Value::Text("x".into()));
        map.insert(Value::Text("v".into()), Value::Text("y".into()));
        map.insert(Value::Text("ts".into()), Value::Integer(1));
        map.insert(Value::Text("node".into()), Value::Text("n".into()));
        map.insert(Value::Text("seq".into()), Value::Integer(1));
        map.insert(Value::Text("del".into()), Value::Bool(false));
        map.insert(Value::Text("unexpected".into()), Value::Bool(true));
        let bytes = serde_cbor::to_vec(&Value::Map(map)).unwrap();
        assert!(matches!(
            decode_event(&bytes),
            Err(CodecError::UnknownField(_))
        ));
    }

    #[test]
    fn oversized_value_rejected_before_network() {
        let big = "x".repeat(MAX_REPLICATION_BYTES);
        let ev = ReplicationEvent::new(
            "k",
            Some(big),
            &Version::new(1, "n"),
            1,
            false,
        );
        assert!(matches!(
            encode_event(&ev),
            Err(CodecError::TooLarge { .. })
        ));
    }
}
