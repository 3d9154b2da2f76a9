//! # Correlator
//!
//! Matches outgoing commands to their eventual response on the response
//! topic (§4.G). Registers `(id -> waker)`, publishes the command via a
//! caller-supplied closure, and races the wait against a per-op timeout
//! budget. Generalizes the teacher's `sync.rs` use of `tokio::time` for
//! scheduled work to a per-request `tokio::time::timeout`, so the timer
//! bookkeeping is "for free" rather than hand-rolled deadline tracking.

use crate::error::Error;
use crate::model::{Op, ResponseEnvelope};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Single-key operation budget (§4.G).
pub const TIMEOUT_SINGLE_KEY: Duration = Duration::from_secs(10);
/// Bulk operation budget (MGET/MSET).
pub const TIMEOUT_BULK: Duration = Duration::from_secs(20);
/// Anti-entropy sync cycle deadline.
pub const TIMEOUT_SYNC: Duration = Duration::from_secs(30);

/// The timeout budget for a given op, per §4.G's table.
pub fn timeout_for(op: Op) -> Duration {
    match op {
        Op::Mget | Op::Mset => TIMEOUT_BULK,
        _ => TIMEOUT_SINGLE_KEY,
    }
}

/// Request-id to waiting-caller correlation table.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`, run `publish` to actually send the
    /// command, then wait up to `timeout` for a matching response. If
    /// `publish` fails, the waiter is torn down before returning the error
    /// (no pending entry survives a publish that never happened).
    pub async fn request<F, Fut>(
        &self,
        id: String,
        timeout: Duration,
        op_name: &'static str,
        publish: F,
    ) -> Result<ResponseEnvelope, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("correlator poisoned");
            pending.insert(id.clone(), tx);
        }

        if let Err(err) = publish().await {
            self.pending
                .lock()
                .expect("correlator poisoned")
                .remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Connection {
                state: "cancelled".to_string(),
            }),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("correlator poisoned")
                    .remove(&id);
                Err(Error::Timeout {
                    op: op_name,
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Deliver a matching response, waking its waiter. Returns `false` if
    /// no waiter is registered for `response.id` (e.g. a retry whose
    /// original caller already timed out).
    pub fn complete(&self, response: ResponseEnvelope) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("correlator poisoned")
            .remove(&response.id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Fail every pending waiter, as happens on disconnect with no offline
    /// buffering (§4.G). Dropping each sender resolves its receiver with a
    /// recv error, which `request` turns into `Error::Connection`.
    pub fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("correlator poisoned");
        pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseEnvelope;

    #[tokio::test]
    async fn matching_response_wakes_waiter() {
        let correlator = std::sync::Arc::new(Correlator::new());
        let c2 = correlator.clone();
        let handle = tokio::spawn(async move {
            c2.request(
                "id1".to_string(),
                Duration::from_secs(1),
                "GET",
                || async { Ok(()) },
            )
            .await
        });

        tokio::task::yield_now().await;
        assert!(correlator.complete(ResponseEnvelope::ok("id1", None)));
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn timeout_fires_when_no_response_arrives() {
        let correlator = Correlator::new();
        let result = correlator
            .request("id2".to_string(), Duration::from_millis(20), "GET", || async {
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_tears_down_waiter_without_waiting() {
        let correlator = Correlator::new();
        let result = correlator
            .request("id3".to_string(), Duration::from_secs(5), "SET", || async {
                Err(Error::Connection {
                    state: "disconnected".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_waiter_as_connection_error() {
        let correlator = std::sync::Arc::new(Correlator::new());
        let c2 = correlator.clone();
        let handle = tokio::spawn(async move {
            c2.request(
                "id4".to_string(),
                Duration::from_secs(5),
                "GET",
                || async { Ok(()) },
            )
            .await
        });
        tokio::task::yield_now().await;
        correlator.fail_all();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[test]
    fn timeout_budget_matches_op_table() {
        assert_eq!(timeout_for(Op::Get), TIMEOUT_SINGLE_KEY);
        assert_eq!(timeout_for(Op::Mget), TIMEOUT_BULK);
        assert_eq!(timeout_for(Op::Mset), TIMEOUT_BULK);
    }
}
