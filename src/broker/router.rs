//! # Topic Router & Authorization (§4.E)
//!
//! Sits above [`BrokerClient`](crate::broker::client::BrokerClient):
//! stores `(filter, handler)` pairs, matches inbound topics against them
//! with `topic::matches`, enforces the per-client ACL table when the
//! topic prefix normalizes to the canonical `merkle_kv`, and drives
//! SUBACK-gated restoration after a reconnect.
//!
//! "Dynamic dispatch of handlers" (§9) becomes this: the router calls a
//! stored capability *by message*, never by method lookup on a concrete
//! type, matching the teacher's lack of any such polymorphism and the
//! spec's explicit redesign note.

use crate::broker::client::{BrokerClient, ConnectionState, InboundMessage};
use crate::broker::topic;
use crate::config::{NodeConfig, ReplicationAccess};
use crate::error::Error;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Safety timeout for SUBACK-gated restoration (§4.E).
pub const RESTORE_TIMEOUT: Duration = Duration::from_millis(750);

pub type Handler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Outcome of an ACL check, kept distinct from `Error` so callers that
/// only want a yes/no (e.g. observability counters) don't need to match
/// on the full error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDecision {
    Allowed,
    Denied,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AclCounters {
    pub command_allowed: u64,
    pub command_denied: u64,
    pub replication_allowed: u64,
    pub replication_denied: u64,
    pub response_subscribe_allowed: u64,
    pub response_subscribe_denied: u64,
}

struct FilterEntry {
    handlers: Vec<Handler>,
}

pub struct Router {
    client: BrokerClient,
    config: Arc<NodeConfig>,
    handlers: Mutex<HashMap<String, FilterEntry>>,
    active_filters: Mutex<HashSet<String>>,
    pending_restore: Mutex<HashSet<String>>,
    restore_notify: Arc<Notify>,
    restored_tx: watch::Sender<bool>,
    restored_rx: watch::Receiver<bool>,
    counters: Mutex<AclCounters>,
    restore_generation: AtomicU64,
}

impl Router {
    pub fn new(client: BrokerClient, config: Arc<NodeConfig>) -> Arc<Self> {
        let (restored_tx, restored_rx) = watch::channel(true);
        let router = Arc::new(Self {
            client,
            config,
            handlers: Mutex::new(HashMap::new()),
            active_filters: Mutex::new(HashSet::new()),
            pending_restore: Mutex::new(HashSet::new()),
            restore_notify: Arc::new(Notify::new()),
            restored_tx,
            restored_rx,
            counters: Mutex::new(AclCounters::default()),
            restore_generation: AtomicU64::new(0),
        });
        spawn_dispatch_loop(router.clone());
        spawn_subscribed_loop(router.clone());
        spawn_restore_driver(router.clone());
        router
    }

    fn is_canonical_prefix(&self) -> bool {
        self.config.topic_prefix == "merkle_kv"
    }

    /// §4.E's authorization table, enforced only under the canonical
    /// prefix. Every other prefix runs with no client-side ACL at all.
    pub fn check_publish_command(&self, target_client_id: &str) -> Result<(), Error> {
        if !self.is_canonical_prefix() || self.config.is_controller || target_client_id == self.config.client_id {
            self.bump(|c| c.command_allowed += 1);
            return Ok(());
        }
        self.bump(|c| c.command_denied += 1);
        Err(Error::Authorization {
            action: format!("publish command to '{target_client_id}'"),
            code: 300,
        })
    }

    pub fn check_publish_replication(&self) -> Result<(), Error> {
        if !self.is_canonical_prefix() || self.config.replication_access == ReplicationAccess::ReadWrite {
            self.bump(|c| c.replication_allowed += 1);
            return Ok(());
        }
        self.bump(|c| c.replication_denied += 1);
        Err(Error::Authorization {
            action: "publish replication event".to_string(),
            code: 301,
        })
    }

    pub fn check_subscribe_responses(&self, target_client_id: &str) -> Result<(), Error> {
        if !self.is_canonical_prefix() || self.config.is_controller || target_client_id == self.config.client_id {
            self.bump(|c| c.response_subscribe_allowed += 1);
            return Ok(());
        }
        self.bump(|c| c.response_subscribe_denied += 1);
        Err(Error::Authorization {
            action: format!("subscribe to responses of '{target_client_id}'"),
            code: 302,
        })
    }

    fn bump(&self, f: impl FnOnce(&mut AclCounters)) {
        f(&mut self.counters.lock().expect("acl counters poisoned"));
    }

    pub fn acl_counters(&self) -> AclCounters {
        *self.counters.lock().expect("acl counters poisoned")
    }

    /// Register `handler` under `filter`, issuing the MQTT SUBSCRIBE and
    /// marking `filter` active for restoration. Duplicate registrations
    /// (by `Arc` pointer identity) of the same handler under the same
    /// filter are no-ops.
    pub async fn subscribe(&self, filter: &str, handler: Handler) -> Result<(), Error> {
        topic::validate_topic(filter, &self.config.topic_prefix)
            .map_err(|reason| Error::Validation {
                field: "filter",
                value: filter.to_string(),
                reason,
            })?;

        let is_new_filter = {
            let mut handlers = self.handlers.lock().expect("handlers poisoned");
            let entry = handlers.entry(filter.to_string()).or_insert_with(|| FilterEntry {
                handlers: Vec::new(),
            });
            let already_registered = entry
                .handlers
                .iter()
                .any(|existing| Arc::ptr_eq(existing, &handler));
            if !already_registered {
                entry.handlers.push(handler);
            }
            entry.handlers.len() == 1
        };

        self.active_filters
            .lock()
            .expect("active filters poisoned")
            .insert(filter.to_string());

        if is_new_filter {
            self.client.subscribe(filter).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        self.handlers.lock().expect("handlers poisoned").remove(filter);
        self.active_filters
            .lock()
            .expect("active filters poisoned")
            .remove(filter);
        self.client.unsubscribe(filter).await
    }

    /// Block until subscription restoration completes, or `timeout`
    /// elapses (whichever is first). Lets higher layers sequence
    /// deterministically after a reconnect (§4.E).
    pub async fn await_restore(&self, timeout: Duration) -> bool {
        if *self.restored_rx.borrow() {
            return true;
        }
        let mut rx = self.restored_rx.clone();
        tokio::time::timeout(timeout, async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

fn dispatch(router: &Router, message: InboundMessage) {
    let handlers_snapshot: Vec<Handler> = {
        let handlers = router.handlers.lock().expect("handlers poisoned");
        handlers
            .iter()
            .filter(|(filter, _)| topic::matches(filter, &message.topic))
            .flat_map(|(_, entry)| entry.handlers.iter().cloned())
            .collect()
    };
    // Dispatch for a single filter is sequential per message arrival by
    // construction: this loop processes one inbound message at a time on
    // the single consumer task below, so no two messages for the same
    // filter ever race each other here.
    for handler in handlers_snapshot {
        handler(message.clone());
    }
}

fn spawn_dispatch_loop(router: Arc<Router>) {
    let mut inbound = router.client.inbound();
    tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Ok(message) => dispatch(&router, message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("router dispatch loop lagged, dropped {n} messages");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_subscribed_loop(router: Arc<Router>) {
    let mut subscribed = router.client.on_subscribed();
    tokio::spawn(async move {
        loop {
            match subscribed.recv().await {
                Ok(filter) => {
                    let now_empty = {
                        let mut pending = router.pending_restore.lock().expect("pending restore poisoned");
                        pending.remove(&filter);
                        pending.is_empty()
                    };
                    if now_empty {
                        let _ = router.restored_tx.send(true);
                        router.restore_notify.notify_waiters();
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// On every transition to `Connected`, re-subscribes to every
/// previously-active filter and completes restoration once the broker
/// SUBACKs all of them or `RESTORE_TIMEOUT` elapses, whichever first
/// (§4.E).
fn spawn_restore_driver(router: Arc<Router>) {
    let mut state_rx = router.client.connection_state();
    tokio::spawn(async move {
        loop {
            if state_rx.changed().await.is_err() {
                break;
            }
            if *state_rx.borrow() != ConnectionState::Connected {
                continue;
            }

            let generation = router.restore_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let filters: Vec<String> = router
                .active_filters
                .lock()
                .expect("active filters poisoned")
                .iter()
                .cloned()
                .collect();

            if filters.is_empty() {
                let _ = router.restored_tx.send(true);
                continue;
            }

            let _ = router.restored_tx.send(false);
            {
                let mut pending = router.pending_restore.lock().expect("pending restore poisoned");
                pending.clear();
                pending.extend(filters.iter().cloned());
            }
            for filter in &filters {
                if let Err(err) = router.client.subscribe(filter).await {
                    log::warn!("restore re-subscribe to '{filter}' failed: {err}");
                }
            }

            let router2 = router.clone();
            tokio::spawn(async move {
                let notified = router2.restore_notify.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(RESTORE_TIMEOUT) => {
                        if router2.restore_generation.load(Ordering::SeqCst) == generation {
                            let still_pending = !router2
                                .pending_restore
                                .lock()
                                .expect("pending restore poisoned")
                                .is_empty();
                            if still_pending {
                                log::warn!(
                                    "subscription restoration timed out after {:?}, completing anyway",
                                    RESTORE_TIMEOUT
                                );
                                let _ = router2.restored_tx.send(true);
                            }
                        }
                    }
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfigBuilder;

    fn router_with(is_controller: bool, client_id: &str) -> Arc<Router> {
        let config = Arc::new(
            NodeConfigBuilder::new(client_id, client_id)
                .is_controller(is_controller)
                .build()
                .unwrap(),
        );
        let client = BrokerClient::start(config.clone());
        Router::new(client, config)
    }

    #[tokio::test]
    async fn self_client_may_always_publish_own_command_topic() {
        let router = router_with(false, "node-a");
        assert!(router.check_publish_command("node-a").is_ok());
    }

    #[tokio::test]
    async fn non_controller_denied_publishing_to_other_client() {
        let router = router_with(false, "node-a");
        let result = router.check_publish_command("node-b");
        assert!(matches!(result, Err(Error::Authorization { code: 300, .. })));
    }

    #[tokio::test]
    async fn controller_may_publish_to_any_client() {
        let router = router_with(true, "node-a");
        assert!(router.check_publish_command("node-b").is_ok());
    }

    #[tokio::test]
    async fn replication_write_denied_without_readwrite_access() {
        let config = Arc::new(
            NodeConfigBuilder::new("node-a", "node-a")
                .replication_access(ReplicationAccess::Read)
                .build()
                .unwrap(),
        );
        let client = BrokerClient::start(config.clone());
        let router = Router::new(client, config);
        let result = router.check_publish_replication();
        assert!(matches!(result, Err(Error::Authorization { code: 301, .. })));
    }

    #[tokio::test]
    async fn acl_counters_track_allowed_and_denied() {
        let router = router_with(false, "node-a");
        let _ = router.check_publish_command("node-a");
        let _ = router.check_publish_command("node-b");
        let counters = router.acl_counters();
        assert_eq!(counters.command_allowed, 1);
        assert_eq!(counters.command_denied, 1);
    }
}
