//! # Topic Scheme
//!
//! Canonical topic construction and MQTT wildcard matching (§4.E). Kept
//! dependency-free and pure, same as the teacher's `protocol.rs` parser;
//! no reason for string/topic logic to reach for a crate.

const MAX_TOPIC_BYTES: usize = 100;
const MAX_PREFIX_BYTES: usize = 50;

/// Build the command topic `{prefix}/{clientId}/cmd`.
pub fn command_topic(prefix: &str, client_id: &str) -> String {
    format!("{prefix}/{client_id}/cmd")
}

/// Build the response topic `{prefix}/{clientId}/res`.
pub fn response_topic(prefix: &str, client_id: &str) -> String {
    format!("{prefix}/{client_id}/res")
}

/// Build the shared replication-events topic `{prefix}/replication/events`.
pub fn replication_topic(prefix: &str) -> String {
    format!("{prefix}/replication/events")
}

/// Build the per-node anti-entropy sync topic `{prefix}/replication/sync/{nodeId}`.
pub fn sync_topic(prefix: &str, node_id: &str) -> String {
    format!("{prefix}/replication/sync/{node_id}")
}

/// Build the retained capabilities-probe topic `{prefix}/capabilities/probe`.
pub fn probe_topic(prefix: &str) -> String {
    format!("{prefix}/capabilities/probe")
}

/// Validate a fully-built topic string against §4.E's length and charset
/// rules: the whole topic ≤ 100 bytes, the prefix component ≤ 50 bytes,
/// every component drawn from `[A-Za-z0-9_/-]`.
pub fn validate_topic(topic: &str, prefix: &str) -> Result<(), String> {
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(format!(
            "topic '{topic}' exceeds {MAX_TOPIC_BYTES} bytes"
        ));
    }
    if prefix.len() > MAX_PREFIX_BYTES {
        return Err(format!(
            "topic prefix '{prefix}' exceeds {MAX_PREFIX_BYTES} bytes"
        ));
    }
    if !topic
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'/' | b'-'))
    {
        return Err(format!("topic '{topic}' has invalid characters"));
    }
    Ok(())
}

/// MQTT wildcard match: `+` matches exactly one topic level, `#` matches
/// any number of remaining levels and must be the final token. No other
/// wildcard characters are recognized (matching the MQTT 3.1.1 spec).
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;
    loop {
        match (filter_levels.get(fi), topic_levels.get(ti)) {
            (Some(&"#"), _) => return fi == filter_levels.len() - 1,
            (Some(&"+"), Some(_)) => {
                fi += 1;
                ti += 1;
            }
            (Some(f), Some(t)) if f == t => {
                fi += 1;
                ti += 1;
            }
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute-force reference matcher used only in tests, to check `matches`
    /// against an independent implementation over random-ish inputs.
    fn reference_matches(filter: &str, topic: &str) -> bool {
        let f: Vec<&str> = filter.split('/').collect();
        let t: Vec<&str> = topic.split('/').collect();

        fn go(f: &[&str], t: &[&str]) -> bool {
            match (f.first(), t.first()) {
                (Some(&"#"), _) => f.len() == 1,
                (Some(&"+"), Some(_)) => go(&f[1..], &t[1..]),
                (Some(a), Some(b)) if a == b => go(&f[1..], &t[1..]),
                (None, None) => true,
                _ => false,
            }
        }
        go(&f, &t)
    }

    #[test]
    fn exact_match() {
        assert!(matches("merkle_kv/node1/cmd", "merkle_kv/node1/cmd"));
        assert!(!matches("merkle_kv/node1/cmd", "merkle_kv/node2/cmd"));
    }

    #[test]
    fn plus_matches_single_level() {
        assert!(matches("merkle_kv/+/cmd", "merkle_kv/node1/cmd"));
        assert!(!matches("merkle_kv/+/cmd", "merkle_kv/node1/extra/cmd"));
    }

    #[test]
    fn hash_matches_any_remaining_levels() {
        assert!(matches("merkle_kv/replication/#", "merkle_kv/replication/events"));
        assert!(matches(
            "merkle_kv/replication/#",
            "merkle_kv/replication/sync/node1"
        ));
        assert!(matches("merkle_kv/replication/#", "merkle_kv/replication"));
    }

    #[test]
    fn hash_must_be_final_token_to_match_at_all() {
        assert!(!matches("merkle_kv/#/cmd", "merkle_kv/node1/cmd"));
    }

    #[test]
    fn property_agrees_with_reference_matcher() {
        let filters = [
            "a/b/c",
            "a/+/c",
            "a/#",
            "+/+/+",
            "a/b/+",
            "#",
            "merkle_kv/+/res",
        ];
        let topics = [
            "a/b/c",
            "a/x/c",
            "a/b",
            "a/b/c/d",
            "x/y/z",
            "merkle_kv/node1/res",
            "merkle_kv/node1/res/extra",
        ];
        for f in filters {
            for t in topics {
                assert_eq!(
                    matches(f, t),
                    reference_matches(f, t),
                    "mismatch for filter={f} topic={t}"
                );
            }
        }
    }

    #[test]
    fn topic_builders_match_canonical_scheme() {
        assert_eq!(command_topic("merkle_kv", "node1"), "merkle_kv/node1/cmd");
        assert_eq!(response_topic("merkle_kv", "node1"), "merkle_kv/node1/res");
        assert_eq!(
            replication_topic("merkle_kv"),
            "merkle_kv/replication/events"
        );
        assert_eq!(
            sync_topic("merkle_kv", "node1"),
            "merkle_kv/replication/sync/node1"
        );
        assert_eq!(probe_topic("merkle_kv"), "merkle_kv/capabilities/probe");
    }

    #[test]
    fn oversized_topic_rejected() {
        let long_prefix = "p".repeat(60);
        let topic = format!("{long_prefix}/node1/cmd");
        assert!(validate_topic(&topic, &long_prefix).is_err());
    }
}
