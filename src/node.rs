//! # Node Assembly (§2)
//!
//! Wires every subsystem together: broker client and topic router, command
//! processor and correlator, replication outbox/applier/anti-entropy, the
//! offline queue, tombstone GC, and the lifecycle manager. This is the
//! crate's one "god object", deliberately: the teacher's `main.rs`
//! plays the same role (constructing the engine, wiring `Server::new`,
//! spawning the accept loop) and nothing here does more than that
//! teacher-style wiring.

use crate::broker::{topic, BrokerClient, InboundMessage, Router};
use crate::command::Processor;
use crate::config::NodeConfig;
use crate::correlator::{timeout_for, Correlator};
use crate::error::Error;
use crate::lifecycle::LifecycleManager;
use crate::model::{CommandEnvelope, Op, Priority, ResponseEnvelope};
use crate::queue::OfflineQueue;
use crate::replication::anti_entropy::AntiEntropy;
use crate::replication::{Applier, Outbox};
use crate::store::{Journal, VersionedStore};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One running replica: every subsystem in §4 assembled around a shared
/// [`VersionedStore`].
pub struct Node {
    config: Arc<NodeConfig>,
    client: BrokerClient,
    router: Arc<Router>,
    store: Arc<VersionedStore>,
    processor: Arc<Processor>,
    correlator: Arc<Correlator>,
    outbox: Arc<Outbox>,
    applier: Arc<Applier>,
    anti_entropy: Arc<AntiEntropy>,
    offline_queue: Arc<OfflineQueue>,
    lifecycle: Arc<LifecycleManager>,
    journal: Option<Arc<Mutex<Journal>>>,
}

impl Node {
    /// Build and start every subsystem: open the journal (if persistence
    /// is enabled) and replay it into the store, start the broker client,
    /// register topic handlers, and spawn the background tasks (replay
    /// applier dispatch, anti-entropy announcements, tombstone GC, offline
    /// queue sweeps).
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>, Error> {
        let config = Arc::new(config);
        let store = Arc::new(VersionedStore::new());

        let journal = if config.persistence_enabled {
            let records = Journal::replay(&config.storage_path)
                .map_err(|e| Error::Storage(e.to_string()))?;
            for record in records {
                let version = record.version();
                if record.tombstone {
                    store.apply_remote(
                        &record.key,
                        crate::model::VersionedEntry::tombstone(version, 0),
                    );
                } else {
                    store.apply_remote(
                        &record.key,
                        crate::model::VersionedEntry::live(
                            record.value.unwrap_or_default(),
                            version,
                            0,
                        ),
                    );
                }
            }
            let journal = Journal::open(&config.storage_path).map_err(|e| Error::Storage(e.to_string()))?;
            Some(Arc::new(Mutex::new(journal)))
        } else {
            None
        };

        let client = BrokerClient::start(config.clone());
        let router = Router::new(client.clone(), config.clone());
        let processor = Arc::new(Processor::new(store.clone(), config.node_id.clone()));
        let correlator = Arc::new(Correlator::new());
        let applier = Arc::new(Applier::new(
            store.clone(),
            config.node_id.clone(),
            config.skew_max_future_ms,
        ));
        let replication_topic = topic::replication_topic(&config.topic_prefix);
        let outbox = Arc::new(Outbox::start(
            client.clone(),
            router.clone(),
            replication_topic.clone(),
            journal.clone(),
        ));
        processor.set_outbox(outbox.clone());
        let anti_entropy = Arc::new(AntiEntropy::new(
            store.clone(),
            client.clone(),
            config.node_id.clone(),
            config.topic_prefix.clone(),
            Duration::from_secs(60),
        ));

        let queue_path = config
            .persistence_enabled
            .then(|| std::path::PathBuf::from(&config.storage_path).with_extension("queue"));
        let offline_queue = Arc::new(match queue_path {
            Some(path) => OfflineQueue::load(
                config.max_queued_ops,
                config.queue_max_age_seconds.saturating_mul(1000),
                path,
            ),
            None => OfflineQueue::new(config.max_queued_ops, config.queue_max_age_seconds.saturating_mul(1000), None),
        });

        let lifecycle = Arc::new(LifecycleManager::start(client.clone(), Some(outbox.clone())));

        let node = Arc::new(Self {
            config,
            client,
            router,
            store,
            processor,
            correlator,
            outbox,
            applier,
            anti_entropy,
            offline_queue,
            lifecycle,
            journal,
        });

        node.register_handlers().await?;
        node.client.connect().await?;
        node.anti_entropy.clone().spawn_announce_loop();
        node.spawn_tombstone_gc();
        node.spawn_queue_sweep();
        node.spawn_drain_on_reconnect();
        node.spawn_journal_compaction();

        Ok(node)
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.offline_queue
    }

    /// Subscribe to this node's own command topic, the shared replication
    /// topic, its own response topic (so peers' replies route back
    /// through the correlator), and the wildcard sync topic for
    /// anti-entropy (§2).
    async fn register_handlers(&self) -> Result<(), Error> {
        let cmd_topic = topic::command_topic(&self.config.topic_prefix, &self.config.client_id);
        let res_topic = topic::response_topic(&self.config.topic_prefix, &self.config.client_id);
        let repl_topic = topic::replication_topic(&self.config.topic_prefix);
        let sync_filter = format!("{}/replication/sync/+", self.config.topic_prefix);

        let processor = self.processor.clone();
        let client_for_cmd = self.client.clone();
        let response_topic_for_cmd = res_topic.clone();
        self.router
            .subscribe(
                &cmd_topic,
                Arc::new(move |msg: InboundMessage| {
                    let processor = processor.clone();
                    let client = client_for_cmd.clone();
                    let response_topic = response_topic_for_cmd.clone();
                    tokio::spawn(async move {
                        handle_command_message(processor, client, response_topic, msg).await;
                    });
                }),
            )
            .await?;

        let correlator_for_res = self.correlator.clone();
        self.router
            .subscribe(
                &res_topic,
                Arc::new(move |msg: InboundMessage| {
                    if let Ok(response) = serde_json::from_slice::<ResponseEnvelope>(&msg.payload) {
                        correlator_for_res.complete(response);
                    }
                }),
            )
            .await?;

        let applier_for_repl = self.applier.clone();
        self.router
            .subscribe(
                &repl_topic,
                Arc::new(move |msg: InboundMessage| {
                    if let Err(reason) = applier_for_repl.apply_bytes(&msg.payload, now_ms()) {
                        log::debug!("replication event rejected: {:?}", reason);
                    }
                }),
            )
            .await?;

        let anti_entropy_for_sync = self.anti_entropy.clone();
        self.router
            .subscribe(
                &sync_filter,
                Arc::new(move |msg: InboundMessage| {
                    let ae = anti_entropy_for_sync.clone();
                    tokio::spawn(async move {
                        if let Err(err) = ae.handle_root_announcement(&msg.payload).await {
                            log::debug!("anti-entropy root announcement handling failed: {err}");
                        }
                    });
                }),
            )
            .await?;

        Ok(())
    }

    /// Issue one command as this node's own client, through the
    /// correlator, respecting the op's timeout budget (§4.F/§4.G). If the
    /// client isn't connected, the command is buffered in the offline
    /// queue instead when that's enabled (§4.I), and an immediate
    /// `Connection` error is returned to the caller; the eventual
    /// response, if any, only reaches whoever drains the queue on
    /// reconnect.
    pub async fn execute(&self, envelope: CommandEnvelope, priority: Priority) -> Result<ResponseEnvelope, Error> {
        if self.client.state() != crate::broker::ConnectionState::Connected {
            let op = envelope.op;
            self.offline_queue.enqueue(envelope.id.clone(), priority, envelope, now_ms())?;
            return Err(Error::Connection {
                state: format!("queued offline for {:?}", op),
            });
        }

        let cmd_topic = topic::command_topic(&self.config.topic_prefix, &self.config.client_id);
        self.router.check_publish_command(&self.config.client_id)?;

        let id = envelope.id.clone();
        let timeout = timeout_for(envelope.op);
        let op_name = op_name(envelope.op);
        let client = self.client.clone();

        self.correlator
            .request(id, timeout, op_name, move || {
                let client = client.clone();
                async move {
                    let bytes = serde_json::to_vec(&envelope).map_err(|e| Error::Internal(e.to_string()))?;
                    client.publish(cmd_topic, bytes, false).await
                }
            })
            .await
    }

    fn spawn_tombstone_gc(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                let retention = node.tombstone_retention_hours();
                let removed = node.store.gc_tombstones(now_ms(), retention);
                if removed > 0 {
                    log::info!("tombstone GC removed {removed} expired tombstones");
                }
            }
        });
    }

    /// §9's resurrection-safety rule: extend the configured retention
    /// window to at least the time since this node last heard any
    /// replication activity, so a long partition can't let a tombstone
    /// expire locally before every peer has seen it.
    fn tombstone_retention_hours(&self) -> u64 {
        let configured = self.config.tombstone_retention_hours;
        let last_activity = self.applier.last_activity_ms();
        if last_activity == 0 {
            return configured;
        }
        let hours_since_activity = now_ms().saturating_sub(last_activity) / 3_600_000;
        configured.max(hours_since_activity)
    }

    /// Periodically rewrite the journal to keep only each key's winning
    /// entry, bounding its size as the same keys are mutated repeatedly.
    /// A no-op when persistence is disabled.
    fn spawn_journal_compaction(self: &Arc<Self>) {
        let Some(journal) = self.journal.clone() else {
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
            loop {
                ticker.tick().await;
                let snapshot = store.snapshot();
                let borrowed: Vec<(&str, &crate::model::VersionedEntry)> =
                    snapshot.iter().map(|(k, e)| (k.as_str(), e)).collect();
                if let Err(err) = journal.lock().expect("journal poisoned").compact(&borrowed) {
                    log::warn!("journal compaction failed: {err}");
                }
            }
        });
    }

    fn spawn_queue_sweep(self: &Arc<Self>) {
        let queue = self.offline_queue.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                queue.sweep(now_ms());
            }
        });
    }

    /// On every transition to `Connected`, drain the offline queue in
    /// `queueBatchSize` batches, replaying each buffered command through
    /// the same `execute` path a live caller would use (§4.I).
    fn spawn_drain_on_reconnect(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut state_rx = node.client.connection_state();
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                if *state_rx.borrow() != crate::broker::ConnectionState::Connected {
                    continue;
                }
                node.router.await_restore(Duration::from_millis(800)).await;
                node.drain_offline_queue().await;
            }
        });
    }

    async fn drain_offline_queue(&self) {
        loop {
            let batch = self
                .offline_queue
                .dequeue_batch(self.config.queue_batch_size, now_ms());
            if batch.is_empty() {
                break;
            }
            for op in batch {
                match self.execute(op.payload, op.priority).await {
                    Ok(_) => self.offline_queue.mark_processed(now_ms()),
                    Err(err) => {
                        log::warn!("offline queue replay of '{}' failed: {err}", op.op_id);
                        self.offline_queue.mark_failed(now_ms());
                    }
                }
            }
        }
    }
}

async fn handle_command_message(
    processor: Arc<Processor>,
    client: BrokerClient,
    response_topic: String,
    msg: InboundMessage,
) {
    let envelope: CommandEnvelope = match serde_json::from_slice(&msg.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("dropping malformed command on '{}': {err}", msg.topic);
            return;
        }
    };
    let response = processor.process(envelope).await;
    match serde_json::to_vec(&response) {
        Ok(bytes) => {
            if let Err(err) = client.publish(response_topic, bytes, false).await {
                log::warn!("publishing response failed: {err}");
            }
        }
        Err(err) => log::error!("encoding response failed: {err}"),
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Get => "GET",
        Op::Set => "SET",
        Op::Delete => "DELETE",
        Op::Incr => "INCR",
        Op::Decr => "DECR",
        Op::Append => "APPEND",
        Op::Prepend => "PREPEND",
        Op::Mget => "MGET",
        Op::Mset => "MSET",
    }
}

