//! # Offline Operation Queue (§4.I)
//!
//! A durable, bounded, prioritized backlog consulted when the broker
//! client isn't `Connected`. No direct teacher equivalent exists (the
//! teacher buffers nothing while disconnected); this is modeled after the
//! teacher's preference for simple whole-structure rewrites over
//! incremental WAL bookkeeping (`KvEngine::set`'s copy-on-write clone): the
//! on-disk store is rewritten wholesale on every dequeue batch rather
//! than incrementally compacted, since `maxQueuedOps` (10,000 default)
//! keeps a full rewrite cheap.
//!
//! Distinct from the replication outbox (§4.H): this queue only ever
//! carries user-level [`QueuedOperation`]s, never replication events.

use crate::error::Error;
use crate::model::{CommandEnvelope, Priority, QueuedOperation};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;

const QUEUE_STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    v: u32,
    kind: String,
}

/// Point-in-time counts and age, streamed on every change (§4.I).
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub high_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
    pub processed: u64,
    pub failed: u64,
    pub oldest_age_ms: Option<u64>,
}

struct QueueState {
    high: VecDeque<QueuedOperation>,
    normal: VecDeque<QueuedOperation>,
    low: VecDeque<QueuedOperation>,
    processed: u64,
    failed: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            processed: 0,
            failed: 0,
        }
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedOperation> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn total(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn all_ops(&self) -> Vec<QueuedOperation> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .cloned()
            .collect()
    }

    fn sweep_expired(&mut self, now_ms: u64, max_age_ms: u64) {
        for tier in [&mut self.high, &mut self.normal, &mut self.low] {
            tier.retain(|op| now_ms.saturating_sub(op.queued_at_ms) <= max_age_ms);
        }
    }

    fn oldest_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
            .map(|op| now_ms.saturating_sub(op.queued_at_ms))
            .max()
    }

    fn stats(&self, now_ms: u64) -> QueueStats {
        QueueStats {
            high_count: self.high.len(),
            normal_count: self.normal.len(),
            low_count: self.low.len(),
            processed: self.processed,
            failed: self.failed,
            oldest_age_ms: self.oldest_age_ms(now_ms),
        }
    }

    /// Pop up to `batch_size` ops in priority-desc, FIFO-within-priority
    /// order (§4.I, §8 scenario 6).
    fn pop_batch(&mut self, batch_size: usize) -> Vec<QueuedOperation> {
        let mut batch = Vec::with_capacity(batch_size);
        for tier in [&mut self.high, &mut self.normal, &mut self.low] {
            while batch.len() < batch_size {
                match tier.pop_front() {
                    Some(op) => batch.push(op),
                    None => break,
                }
            }
            if batch.len() == batch_size {
                break;
            }
        }
        batch
    }
}

pub struct OfflineQueue {
    state: Mutex<QueueState>,
    max_ops: usize,
    max_age_ms: u64,
    store_path: Option<PathBuf>,
    stats_tx: watch::Sender<QueueStats>,
}

impl OfflineQueue {
    pub fn new(max_ops: usize, max_age_ms: u64, store_path: Option<PathBuf>) -> Self {
        let (stats_tx, _) = watch::channel(QueueStats::default());
        Self {
            state: Mutex::new(QueueState::new()),
            max_ops,
            max_age_ms,
            store_path,
            stats_tx,
        }
    }

    /// Reconstruct a queue from its durable store, if one exists.
    /// Storage failures degrade to an empty in-memory queue with a
    /// logged warning rather than failing startup (§4.I).
    pub fn load(max_ops: usize, max_age_ms: u64, store_path: PathBuf) -> Self {
        let queue = Self::new(max_ops, max_age_ms, Some(store_path.clone()));
        match replay_queue_store(&store_path) {
            Ok(ops) => {
                let mut state = queue.state.lock().expect("queue poisoned");
                for op in ops {
                    state.tier_mut(op.priority).push_back(op);
                }
            }
            Err(err) => {
                log::warn!(
                    "offline queue store at {} unreadable, starting empty: {err}",
                    store_path.display()
                );
            }
        }
        queue
    }

    pub fn stats(&self) -> watch::Receiver<QueueStats> {
        self.stats_tx.subscribe()
    }

    /// Enqueue one command while disconnected. Evicts oldest Low, then
    /// oldest Normal, to make room when full; High is never evicted. If
    /// still full (i.e. the queue is saturated with High-priority ops),
    /// the new op is rejected rather than silently dropping a High op
    /// (§4.I).
    pub fn enqueue(
        &self,
        op_id: String,
        priority: Priority,
        payload: CommandEnvelope,
        now_ms: u64,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().expect("queue poisoned");
        state.sweep_expired(now_ms, self.max_age_ms);

        if state.total() >= self.max_ops {
            if !state.low.is_empty() {
                state.low.pop_front();
            } else if !state.normal.is_empty() {
                state.normal.pop_front();
            } else {
                return Err(Error::Connection {
                    state: "queue_full".to_string(),
                });
            }
        }

        let op_type = payload.op;
        state.tier_mut(priority).push_back(QueuedOperation {
            op_id,
            op_type,
            priority,
            payload,
            queued_at_ms: now_ms,
            attempts: 0,
            last_error: None,
        });

        self.persist_locked(&state);
        let _ = self.stats_tx.send(state.stats(now_ms));
        Ok(())
    }

    /// Periodic hourly sweep of age-expired ops, independent of enqueue
    /// (§4.I).
    pub fn sweep(&self, now_ms: u64) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.sweep_expired(now_ms, self.max_age_ms);
        self.persist_locked(&state);
        let _ = self.stats_tx.send(state.stats(now_ms));
    }

    /// Pop up to `batch_size` ops, priority-desc then FIFO-within-priority,
    /// for the caller to dispatch via the correlator on reconnect (§4.I).
    pub fn dequeue_batch(&self, batch_size: usize, now_ms: u64) -> Vec<QueuedOperation> {
        let mut state = self.state.lock().expect("queue poisoned");
        let batch = state.pop_batch(batch_size);
        self.persist_locked(&state);
        let _ = self.stats_tx.send(state.stats(now_ms));
        batch
    }

    pub fn mark_processed(&self, now_ms: u64) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.processed += 1;
        let _ = self.stats_tx.send(state.stats(now_ms));
    }

    pub fn mark_failed(&self, now_ms: u64) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.failed += 1;
        let _ = self.stats_tx.send(state.stats(now_ms));
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue poisoned").total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the durable store wholesale. Storage failures degrade to
    /// in-memory-only operation with a logged warning; they never fail
    /// the caller's enqueue/dequeue (§4.I).
    fn persist_locked(&self, state: &QueueState) {
        let Some(path) = &self.store_path else {
            return;
        };
        if let Err(err) = rewrite_queue_store(path, &state.all_ops()) {
            log::warn!("offline queue persistence degraded: {err}");
        }
    }
}

fn rewrite_queue_store(path: &Path, ops: &[QueuedOperation]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("queue.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        let header = Header {
            v: QUEUE_STORE_VERSION,
            kind: "queue".to_string(),
        };
        writeln!(tmp, "{}", serde_json::to_string(&header)?)?;
        for op in ops {
            writeln!(tmp, "{}", serde_json::to_string(op)?)?;
        }
        tmp.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn replay_queue_store(path: &Path) -> std::io::Result<Vec<QueuedOperation>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut ops = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if idx == 0 {
            match serde_json::from_str::<Header>(&line) {
                Ok(header) if header.kind == "queue" && header.v == QUEUE_STORE_VERSION => continue,
                _ => log::warn!("queue store {}: unrecognized header, attempting replay anyway", path.display()),
            }
        }
        match serde_json::from_str::<QueuedOperation>(&line) {
            Ok(op) => ops.push(op),
            Err(err) => log::warn!("queue store {}: skipping corrupt line {}: {err}", path.display(), idx + 1),
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Op;
    use tempfile::tempdir;

    fn envelope(op: Op) -> CommandEnvelope {
        CommandEnvelope {
            id: "x".to_string(),
            op,
            key: Some("k".to_string()),
            value: Some("v".to_string()),
            amount: None,
            keys: None,
            kv: None,
        }
    }

    #[test]
    fn drain_order_is_priority_desc_then_fifo() {
        let queue = OfflineQueue::new(10, 7 * 24 * 3_600_000, None);
        queue.enqueue("k1".to_string(), Priority::Low, envelope(Op::Set), 0).unwrap();
        queue.enqueue("k2".to_string(), Priority::High, envelope(Op::Set), 1).unwrap();
        queue.enqueue("k3".to_string(), Priority::Normal, envelope(Op::Set), 2).unwrap();

        let batch = queue.dequeue_batch(10, 10);
        let ids: Vec<&str> = batch.iter().map(|op| op.op_id.as_str()).collect();
        assert_eq!(ids, vec!["k2", "k3", "k1"]);
    }

    #[test]
    fn full_queue_evicts_low_before_normal_and_never_high() {
        let queue = OfflineQueue::new(2, 7 * 24 * 3_600_000, None);
        queue.enqueue("low".to_string(), Priority::Low, envelope(Op::Set), 0).unwrap();
        queue.enqueue("high".to_string(), Priority::High, envelope(Op::Set), 1).unwrap();
        // queue full (2/2); enqueuing another High should evict "low".
        queue.enqueue("high2".to_string(), Priority::High, envelope(Op::Set), 2).unwrap();
        let batch = queue.dequeue_batch(10, 10);
        let ids: Vec<&str> = batch.iter().map(|op| op.op_id.as_str()).collect();
        assert!(ids.contains(&"high"));
        assert!(ids.contains(&"high2"));
        assert!(!ids.contains(&"low"));
    }

    #[test]
    fn queue_full_of_high_priority_rejects_new_enqueue() {
        let queue = OfflineQueue::new(1, 7 * 24 * 3_600_000, None);
        queue.enqueue("h1".to_string(), Priority::High, envelope(Op::Set), 0).unwrap();
        let result = queue.enqueue("h2".to_string(), Priority::High, envelope(Op::Set), 1);
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[test]
    fn expired_ops_are_swept_on_enqueue() {
        let queue = OfflineQueue::new(10, 1_000, None);
        queue.enqueue("old".to_string(), Priority::Normal, envelope(Op::Set), 0).unwrap();
        queue.enqueue("new".to_string(), Priority::Normal, envelope(Op::Set), 5_000).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn persistence_round_trips_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.queue");
        let queue = OfflineQueue::new(10, 7 * 24 * 3_600_000, Some(path.clone()));
        queue.enqueue("a".to_string(), Priority::High, envelope(Op::Set), 0).unwrap();
        queue.enqueue("b".to_string(), Priority::Low, envelope(Op::Set), 1).unwrap();

        let reloaded = OfflineQueue::load(10, 7 * 24 * 3_600_000, path);
        assert_eq!(reloaded.len(), 2);
    }
}
