//! Offline queue behavior across the persist/reload boundary (§4.I),
//! exercising the public `merkle_kv::queue` surface as a consumer would
//! rather than reaching into `OfflineQueue`'s internals.

use merkle_kv::model::{CommandEnvelope, Op, Priority};
use merkle_kv::queue::OfflineQueue;
use tempfile::tempdir;

fn envelope(id: &str) -> CommandEnvelope {
    CommandEnvelope {
        id: id.to_string(),
        op: Op::Set,
        key: Some("k".to_string()),
        value: Some("v".to_string()),
        amount: None,
        keys: None,
        kv: None,
    }
}

const SEVEN_DAYS_MS: u64 = 7 * 24 * 3_600_000;

#[test]
fn reloaded_queue_drains_in_batches_preserving_priority_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.queue");

    let queue = OfflineQueue::new(100, SEVEN_DAYS_MS, Some(path.clone()));
    for i in 0..5 {
        queue.enqueue(format!("low-{i}"), Priority::Low, envelope("low"), i).unwrap();
    }
    queue.enqueue("urgent".to_string(), Priority::High, envelope("high"), 10).unwrap();
    drop(queue);

    let reloaded = OfflineQueue::load(100, SEVEN_DAYS_MS, path);
    assert_eq!(reloaded.len(), 6);

    let first_batch = reloaded.dequeue_batch(3, 20);
    assert_eq!(first_batch.len(), 3);
    assert_eq!(first_batch[0].op_id, "urgent", "High priority must drain first even after a reload");

    let second_batch = reloaded.dequeue_batch(3, 20);
    assert_eq!(second_batch.len(), 3);
    assert_eq!(reloaded.len(), 0);
}

#[test]
fn stats_reflect_queue_composition_after_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.queue");

    let queue = OfflineQueue::new(100, SEVEN_DAYS_MS, Some(path.clone()));
    queue.enqueue("h".to_string(), Priority::High, envelope("h"), 0).unwrap();
    queue.enqueue("n".to_string(), Priority::Normal, envelope("n"), 0).unwrap();
    queue.enqueue("l".to_string(), Priority::Low, envelope("l"), 0).unwrap();
    drop(queue);

    let reloaded = OfflineQueue::load(100, SEVEN_DAYS_MS, path);
    let stats = reloaded.stats().borrow().clone();
    assert_eq!(stats.high_count, 1);
    assert_eq!(stats.normal_count, 1);
    assert_eq!(stats.low_count, 1);
}
