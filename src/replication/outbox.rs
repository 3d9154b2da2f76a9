//! # Replication Publisher (§4.H)
//!
//! After every successful local mutation, the owning component appends a
//! [`ReplicationEvent`](crate::model::ReplicationEvent) to this outbox. A
//! single worker task drains it to the replication topic with QoS=1,
//! retrying transient publish failures with the same capped
//! backoff+jitter shape §4.D's reconnection policy uses. When persistence
//! is enabled, every queued event is also journaled so it survives a
//! restart before it's been published.
//!
//! Finally implements what the teacher's `replication.rs` doc comment
//! lists as missing: "Integration with the storage engine... Proper
//! error handling and retry logic".

use crate::broker::{Backoff, BrokerClient};
use crate::broker::router::Router;
use crate::codec;
use crate::model::ReplicationEvent;
use crate::store::{Journal, JournalRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub events_published: AtomicU64,
    pub events_failed: AtomicU64,
}

/// The replication-event publish buffer (§9's "Outbox"), distinct from
/// the offline command queue: this one only ever carries
/// `ReplicationEvent`s, never user commands.
pub struct Outbox {
    tx: mpsc::Sender<ReplicationEvent>,
    depth: Arc<AtomicU64>,
    metrics: Arc<OutboxMetrics>,
}

impl Outbox {
    pub fn start(
        client: BrokerClient,
        router: Arc<Router>,
        topic: String,
        journal: Option<Arc<Mutex<Journal>>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        let depth = Arc::new(AtomicU64::new(0));
        let metrics = Arc::new(OutboxMetrics::default());
        spawn_drain_task(client, router, topic, rx, depth.clone(), metrics.clone(), journal);
        Self { tx, depth, metrics }
    }

    /// Enqueue an event for publication. Called once per successful local
    /// mutation (§4.H).
    pub async fn enqueue(&self, event: ReplicationEvent) -> Result<(), crate::error::Error> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(event)
            .await
            .map_err(|_| crate::error::Error::Internal("outbox closed".to_string()))
    }

    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn events_published(&self) -> u64 {
        self.metrics.events_published.load(Ordering::Relaxed)
    }

    pub fn events_failed(&self) -> u64 {
        self.metrics.events_failed.load(Ordering::Relaxed)
    }
}

fn spawn_drain_task(
    client: BrokerClient,
    router: Arc<Router>,
    topic: String,
    mut rx: mpsc::Receiver<ReplicationEvent>,
    depth: Arc<AtomicU64>,
    metrics: Arc<OutboxMetrics>,
    journal: Option<Arc<Mutex<Journal>>>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(journal) = &journal {
                let record = JournalRecord {
                    ts: event.timestamp_ms,
                    node: event.node_id.clone(),
                    key: event.key.clone(),
                    op: "outbox".to_string(),
                    value: event.value.clone(),
                    tombstone: event.tombstone,
                };
                if let Err(err) = journal.lock().expect("journal poisoned").append(&record) {
                    log::warn!("outbox journal append failed: {err}");
                }
            }

            if router.check_publish_replication().is_err() {
                log::warn!("local replication publish denied by ACL; dropping event for key '{}'", event.key);
                depth.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            let mut backoff = Backoff::new();
            loop {
                match codec::encode_event(&event) {
                    Ok(bytes) => match client.publish(topic.clone(), bytes, false).await {
                        Ok(()) => {
                            metrics.events_published.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Err(err) => {
                            log::warn!("replication publish failed for key '{}': {err}", event.key);
                            metrics.events_failed.fetch_add(1, Ordering::Relaxed);
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    },
                    Err(err) => {
                        log::error!("encoding replication event for key '{}' failed: {err}", event.key);
                        metrics.events_failed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
            depth.fetch_sub(1, Ordering::Relaxed);
        }
    });
}
