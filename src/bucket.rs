use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::task::TimerTask;

/// Marker value meaning "this bucket is not currently in the expiry queue".
/// Real expirations are elapsed-ms values and never reach `u64::MAX`.
pub const EXPIRATION_UNSET: u64 = u64::MAX;

/// One wheel slot: every task whose expiration currently rounds to the same
/// tick.
///
/// The expiration marker doubles as the "queued" flag. It transitions
/// unset -> expiry at most once per cycle (a single compare-and-set), which
/// is what keeps a bucket from being pushed into the expiry queue twice while
/// concurrent producers fill it. [`flush`](TaskBucket::flush) resets the
/// marker, so slots are reused for the wheel's entire lifetime and never
/// reallocated.
pub struct TaskBucket {
    tasks: Mutex<VecDeque<TimerTask>>,
    expiration: AtomicU64,
}

impl TaskBucket {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            expiration: AtomicU64::new(EXPIRATION_UNSET),
        }
    }

    /// Appends a task. Tasks sharing a bucket have no relative order.
    pub fn add_task(&self, task: TimerTask) {
        self.tasks.lock().push_back(task);
    }

    /// Arms the expiration marker if it is currently unset.
    ///
    /// Returns true exactly once per expiration cycle; the caller uses that
    /// as the sole signal to enqueue the bucket into the expiry queue.
    pub fn try_set_expiration(&self, expiration_ms: u64) -> bool {
        self.expiration
            .compare_exchange(
                EXPIRATION_UNSET,
                expiration_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current marker value, [`EXPIRATION_UNSET`] when the bucket is idle.
    #[inline]
    pub fn expiration(&self) -> u64 {
        self.expiration.load(Ordering::Acquire)
    }

    /// Drains every task through `visit` and resets the marker, making the
    /// slot immediately reusable.
    ///
    /// The drain and the marker reset share one critical section: a producer
    /// appending after the drain always observes the unset marker, wins the
    /// next CAS and re-enqueues the bucket. The worst interleaving yields a
    /// spurious empty flush, never a stranded task. The visitor runs outside
    /// the lock, so it may add tasks to other buckets freely.
    pub fn flush(&self, mut visit: impl FnMut(TimerTask)) {
        let drained = {
            let mut tasks = self.tasks.lock();
            self.expiration.store(EXPIRATION_UNSET, Ordering::Release);
            std::mem::take(&mut *tasks)
        };

        for task in drained {
            visit(task);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl Default for TaskBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn task(expires_at_ms: u64) -> TimerTask {
        TimerTask::new(expires_at_ms, 0, Box::new(|| {}))
    }

    #[test]
    fn test_add_and_flush() {
        let bucket = TaskBucket::new();
        bucket.add_task(task(100));
        bucket.add_task(task(150));
        assert_eq!(bucket.len(), 2);

        let mut seen = Vec::new();
        bucket.flush(|t| seen.push(t.expires_at_ms()));
        seen.sort();
        assert_eq!(seen, vec![100, 150]);
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_expiration_set_once_per_cycle() {
        let bucket = TaskBucket::new();
        assert_eq!(bucket.expiration(), EXPIRATION_UNSET);

        assert!(bucket.try_set_expiration(500));
        assert!(!bucket.try_set_expiration(500));
        assert!(!bucket.try_set_expiration(700));
        assert_eq!(bucket.expiration(), 500);

        // Flush resets the marker and the bucket becomes armable again.
        bucket.flush(|_| {});
        assert_eq!(bucket.expiration(), EXPIRATION_UNSET);
        assert!(bucket.try_set_expiration(700));
    }

    #[test]
    fn test_concurrent_producers_arm_exactly_once() {
        let bucket = Arc::new(TaskBucket::new());
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let bucket = Arc::clone(&bucket);
            let wins = Arc::clone(&wins);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    bucket.add_task(task(1_000));
                    if bucket.try_set_expiration(1_000) {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert_eq!(bucket.len(), 800);
    }

    #[test]
    fn test_flush_is_reusable_across_cycles() {
        let bucket = TaskBucket::new();

        for cycle in 0..3u64 {
            let expiration = (cycle + 1) * 100;
            bucket.add_task(task(expiration));
            assert!(bucket.try_set_expiration(expiration));

            let mut count = 0;
            bucket.flush(|_| count += 1);
            assert_eq!(count, 1);
            assert!(bucket.is_empty());
        }
    }
}
