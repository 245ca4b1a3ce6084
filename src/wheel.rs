//! One resolution level of a hierarchical timing wheel.
//!
//! Based on "Hashed and Hierarchical Timing Wheels" by Varghese and Lauck:
//! a fixed circular array of buckets advanced by a quantized clock. Tasks
//! whose delay exceeds a level's total span recurse into a lazily built
//! coarser overflow wheel (tick size = this level's span, same slot count),
//! so insertion and per-tick maintenance stay amortized O(1) regardless of
//! how far in the future a task lands. Tasks migrate back down to finer
//! levels (cascade) as their expiration approaches; the flush visitor in the
//! scheduler drives that migration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::bucket::TaskBucket;
use crate::expiry::ExpiryQueue;
use crate::task::TimerTask;

pub struct TimingWheel {
    /// Resolution of one slot, in ms.
    tick_ms: u64,
    /// Slots per level.
    wheel_size: usize,
    /// Total span of this level: `tick_ms * wheel_size`.
    interval_ms: u64,
    /// Current time, quantized down to a tick boundary.
    current_time_ms: AtomicU64,
    buckets: Vec<Arc<TaskBucket>>,
    /// Expiry queue shared by every level of the hierarchy.
    queue: Arc<ExpiryQueue>,
    /// Coarser wheel for tasks beyond `interval_ms`; built once, on first use.
    overflow: OnceLock<Arc<TimingWheel>>,
}

impl TimingWheel {
    pub fn new(tick_ms: u64, wheel_size: usize, start_ms: u64, queue: Arc<ExpiryQueue>) -> Self {
        assert!(tick_ms > 0, "tick_ms must be positive");
        assert!(wheel_size > 0, "wheel_size must be positive");

        let buckets = (0..wheel_size)
            .map(|_| Arc::new(TaskBucket::new()))
            .collect();

        Self {
            tick_ms,
            wheel_size,
            interval_ms: tick_ms * wheel_size as u64,
            current_time_ms: AtomicU64::new(start_ms - (start_ms % tick_ms)),
            buckets,
            queue,
            overflow: OnceLock::new(),
        }
    }

    /// Files a task into this level or a coarser one.
    ///
    /// Returns the task back when its expiration already falls inside the
    /// current tick; the caller executes it immediately instead of parking
    /// it.
    pub fn add_task(&self, task: TimerTask) -> Option<TimerTask> {
        let expiration = task.expires_at_ms();
        let current = self.current_time_ms.load(Ordering::Acquire);

        if expiration < current + self.tick_ms {
            // Already due.
            return Some(task);
        }

        if expiration < current + self.interval_ms {
            // Fits in this level.
            let virtual_id = expiration / self.tick_ms;
            let index = (virtual_id % self.wheel_size as u64) as usize;
            let bucket = &self.buckets[index];
            bucket.add_task(task);

            // The first producer into a cold bucket enqueues it, exactly once
            // per cycle. Losers of the CAS piggyback on the queued entry.
            if bucket.try_set_expiration(expiration) {
                self.queue.push(expiration, Arc::clone(bucket));
            }
            return None;
        }

        self.overflow_wheel().add_task(task)
    }

    /// Advances the quantized clock and propagates the same absolute time to
    /// the overflow wheel.
    ///
    /// Skipped ticks are safe: the new value is always derived from the
    /// absolute clock, never incremented one tick at a time, so no bucket is
    /// lost after a scheduling hiccup.
    pub fn advance_clock(&self, now_ms: u64) {
        let current = self.current_time_ms.load(Ordering::Acquire);
        if now_ms >= current + self.tick_ms {
            self.current_time_ms
                .store(now_ms - (now_ms % self.tick_ms), Ordering::Release);

            if let Some(overflow) = self.overflow.get() {
                overflow.advance_clock(now_ms);
            }
        }
    }

    #[inline]
    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    #[inline]
    pub fn wheel_size(&self) -> usize {
        self.wheel_size
    }

    #[inline]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    #[inline]
    pub fn current_time_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::Acquire)
    }

    fn overflow_wheel(&self) -> &TimingWheel {
        self.overflow.get_or_init(|| {
            Arc::new(TimingWheel::new(
                self.interval_ms,
                self.wheel_size,
                self.current_time_ms.load(Ordering::Acquire),
                Arc::clone(&self.queue),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(expires_at_ms: u64) -> TimerTask {
        TimerTask::new(expires_at_ms, 0, Box::new(|| {}))
    }

    fn wheel(tick_ms: u64, wheel_size: usize) -> (TimingWheel, Arc<ExpiryQueue>) {
        let queue = Arc::new(ExpiryQueue::new());
        let wheel = TimingWheel::new(tick_ms, wheel_size, 0, Arc::clone(&queue));
        (wheel, queue)
    }

    /// Drives the wheel the way the scheduler's tick loop does: advance,
    /// drain, then execute or cascade each flushed task. Returns the times
    /// at which tasks fired.
    fn drive_until(wheel: &TimingWheel, queue: &ExpiryQueue, end_ms: u64) -> Vec<(u64, u64)> {
        let mut fired = Vec::new();
        let tick = wheel.tick_ms();
        let mut now = 0;
        while now <= end_ms {
            wheel.advance_clock(now);
            while let Some(bucket) = queue.poll_expired(now) {
                bucket.flush(|t| {
                    if t.is_expired(now) {
                        fired.push((t.expires_at_ms(), now));
                    } else if let Some(t) = wheel.add_task(t) {
                        fired.push((t.expires_at_ms(), now));
                    }
                });
            }
            now += tick;
        }
        fired
    }

    #[test]
    fn test_due_task_is_handed_back() {
        let (wheel, queue) = wheel(10, 4);

        let returned = wheel.add_task(task(5));
        assert_eq!(returned.unwrap().expires_at_ms(), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_task_within_span_lands_in_a_bucket() {
        let (wheel, queue) = wheel(10, 4);

        assert!(wheel.add_task(task(25)).is_none());
        assert_eq!(queue.len(), 1);

        // Not matured yet.
        assert!(queue.poll_expired(20).is_none());

        let bucket = queue.poll_expired(25).unwrap();
        let mut drained = 0;
        bucket.flush(|_| drained += 1);
        assert_eq!(drained, 1);
    }

    #[test]
    fn test_same_slot_enqueues_bucket_once() {
        let (wheel, queue) = wheel(10, 4);

        // Both round to the tick covering [20, 30).
        assert!(wheel.add_task(task(22)).is_none());
        assert!(wheel.add_task(task(27)).is_none());
        assert_eq!(queue.len(), 1);

        let bucket = queue.poll_expired(30).unwrap();
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_far_task_recurses_into_overflow() {
        let (wheel, queue) = wheel(10, 4);

        // Span is 40ms; 1000ms has to climb several levels up.
        assert!(wheel.add_task(task(1_000)).is_none());
        assert_eq!(queue.len(), 1);

        // The root level itself holds nothing.
        let root_tasks: usize = wheel.buckets.iter().map(|b| b.len()).sum();
        assert_eq!(root_tasks, 0);
    }

    #[test]
    fn test_cascade_fires_at_target_tick_never_early() {
        let (wheel, queue) = wheel(10, 4);

        assert!(wheel.add_task(task(1_000)).is_none());
        let fired = drive_until(&wheel, &queue, 1_100);

        assert_eq!(fired.len(), 1);
        let (expires, fired_at) = fired[0];
        assert_eq!(expires, 1_000);
        assert!(fired_at >= expires, "fired early at {fired_at}");
        assert!(fired_at < expires + wheel.tick_ms() * 2);
    }

    #[test]
    fn test_shared_coarse_bucket_cascades_the_immature_task() {
        let (wheel, queue) = wheel(10, 4);

        // Both land in the same slot of a coarse level (tick 640ms), so the
        // bucket matures with the earlier task and the later one must
        // cascade back down instead of firing with it.
        assert!(wheel.add_task(task(645)).is_none());
        assert!(wheel.add_task(task(1_000)).is_none());
        assert_eq!(queue.len(), 1);

        let mut fired = drive_until(&wheel, &queue, 1_100);
        fired.sort();
        assert_eq!(fired.len(), 2);

        let (early_expires, early_at) = fired[0];
        assert_eq!(early_expires, 645);
        assert!(early_at >= 645);

        let (late_expires, late_at) = fired[1];
        assert_eq!(late_expires, 1_000);
        assert!(late_at >= 1_000, "cascaded task fired early at {late_at}");
    }

    #[test]
    fn test_mixed_delays_all_fire_exactly_once() {
        let (wheel, queue) = wheel(10, 4);

        let expirations = [15u64, 35, 90, 200, 640, 2_500];
        for &expiration in &expirations {
            assert!(wheel.add_task(task(expiration)).is_none());
        }

        let mut fired = drive_until(&wheel, &queue, 2_600);
        fired.sort();
        assert_eq!(fired.len(), expirations.len());
        for (i, &(expires, fired_at)) in fired.iter().enumerate() {
            assert_eq!(expires, expirations[i]);
            assert!(fired_at >= expires, "task {expires} fired early at {fired_at}");
        }
    }

    #[test]
    fn test_advance_clock_quantizes_from_absolute_time() {
        let (wheel, _queue) = wheel(10, 4);
        assert_eq!(wheel.current_time_ms(), 0);

        // A hiccup skipped many ticks; the clock lands on a tick boundary
        // derived from the absolute time.
        wheel.advance_clock(1_003);
        assert_eq!(wheel.current_time_ms(), 1_000);

        // Sub-tick advances are ignored.
        wheel.advance_clock(1_007);
        assert_eq!(wheel.current_time_ms(), 1_000);

        wheel.advance_clock(1_010);
        assert_eq!(wheel.current_time_ms(), 1_010);
    }

    #[test]
    fn test_skipped_ticks_do_not_lose_tasks() {
        let (wheel, queue) = wheel(10, 4);
        assert!(wheel.add_task(task(25)).is_none());

        // Jump straight past the task's tick.
        wheel.advance_clock(400);
        let bucket = queue.poll_expired(400).expect("bucket matured");
        let mut fired = 0;
        bucket.flush(|t| {
            assert!(t.is_expired(400));
            fired += 1;
        });
        assert_eq!(fired, 1);
    }
}
