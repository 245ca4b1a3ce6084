use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bucket::TaskBucket;

/// Delay-ordered queue of buckets, keyed by the expiration each bucket was
/// enqueued with.
///
/// The tick loop polls it non-blockingly: a bucket only comes back once its
/// key has passed. Keys are captured at push time, so a bucket whose marker
/// is reset by a flush keeps its position until it is popped. Buckets with
/// equal keys drain in either order.
pub struct ExpiryQueue {
    heap: Mutex<BinaryHeap<QueuedBucket>>,
}

struct QueuedBucket {
    expiration_ms: u64,
    bucket: Arc<TaskBucket>,
}

impl PartialEq for QueuedBucket {
    fn eq(&self, other: &Self) -> bool {
        self.expiration_ms == other.expiration_ms
    }
}

impl Eq for QueuedBucket {}

impl PartialOrd for QueuedBucket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedBucket {
    // Reversed so the std max-heap pops the minimum key first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.expiration_ms.cmp(&self.expiration_ms)
    }
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Enqueues a bucket under `expiration_ms`. Callers gate this on the
    /// bucket's marker CAS, so a bucket is present at most once per cycle.
    pub fn push(&self, expiration_ms: u64, bucket: Arc<TaskBucket>) {
        self.heap.lock().push(QueuedBucket {
            expiration_ms,
            bucket,
        });
    }

    /// Pops the minimum-keyed bucket if its expiration has passed, without
    /// blocking.
    pub fn poll_expired(&self, now_ms: u64) -> Option<Arc<TaskBucket>> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(queued) if queued.expiration_ms <= now_ms => heap.pop().map(|q| q.bucket),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl Default for ExpiryQueue {
    fn default() -> Self {
        Self::new()
    }
}
