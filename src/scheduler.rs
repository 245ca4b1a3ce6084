//! Public scheduler facade: owns the finest wheel, the dedicated tick
//! thread, and the callback pool.
//!
//! Two thread roles keep timing honest: the tick thread only advances the
//! quantized clock and drains matured buckets, while user callbacks run on
//! the pool. A flushed task either executes (its expiration truly passed) or
//! cascades back into the wheel at a finer resolution, synchronously within
//! the same flush cycle, so no task can be skipped.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::expiry::ExpiryQueue;
use crate::pool::{CallbackPool, Job, panic_message};
use crate::task::TimerTask;
use crate::wheel::TimingWheel;

/// Construction parameters for [`WheelScheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Resolution of the finest wheel level.
    pub tick: Duration,
    /// Slots per wheel level.
    pub wheel_size: usize,
    /// Worker threads executing user callbacks.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            wheel_size: 100,
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Hierarchical timing-wheel scheduler.
///
/// Lifecycle: constructed idle, [`start`](WheelScheduler::start) spins up the
/// tick thread, [`schedule`](WheelScheduler::schedule) is accepted while
/// running, [`stop`](WheelScheduler::stop) halts ticking and the pool and
/// discards not-yet-due tasks. `start` and `stop` are idempotent; once
/// stopped, a scheduler stays stopped.
pub struct WheelScheduler {
    core: Arc<Core>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Core {
    tick: Duration,
    wheel: TimingWheel,
    queue: Arc<ExpiryQueue>,
    pool: CallbackPool,
    start: Instant,
    state: AtomicU8,
}

impl WheelScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let tick_ms = config
            .tick
            .as_millis()
            .clamp(1, u128::from(u64::MAX)) as u64;
        let queue = Arc::new(ExpiryQueue::new());

        let core = Arc::new(Core {
            tick: Duration::from_millis(tick_ms),
            wheel: TimingWheel::new(tick_ms, config.wheel_size, 0, Arc::clone(&queue)),
            queue,
            pool: CallbackPool::new(config.workers),
            start: Instant::now(),
            state: AtomicU8::new(STATE_IDLE),
        });

        Self {
            core,
            tick_thread: Mutex::new(None),
        }
    }

    /// Begins ticking. Idempotent; a no-op on a running or stopped
    /// scheduler.
    pub fn start(&self) {
        if self
            .core
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("tickwheel-tick".into())
            .spawn(move || Core::run(core))
            .expect("failed to spawn tick thread");

        self.tick_thread.lock().replace(handle);
        debug!("scheduler started");
    }

    /// Halts the tick thread and the callback pool, discarding tasks that
    /// have not yet matured. Idempotent.
    pub fn stop(&self) {
        if self.core.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_RUNNING {
            if let Some(handle) = self.tick_thread.lock().take() {
                let _ = handle.join();
            }
            debug!("scheduler stopped; pending tasks discarded");
        }
        self.core.pool.shutdown();
    }

    /// Schedules `f` to run once `delay` has elapsed, fire-and-forget.
    ///
    /// A delay inside the current tick is submitted to the pool right away
    /// rather than waiting for the next tick. Fails with
    /// [`Error::NotRunning`] before `start` or after `stop`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(delay, Box::new(f))
    }

    /// Schedules `f` and returns a handle resolving with its outcome.
    ///
    /// The handle yields the callback's return value, or
    /// [`Error::CallbackPanicked`] if it panicked. Dropping the handle does
    /// not cancel execution.
    pub fn schedule_async<F, T>(&self, delay: Duration, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.schedule_task(
            delay,
            Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                    .map_err(|payload| Error::CallbackPanicked(panic_message(payload.as_ref())));
                let _ = sender.send(outcome);
            }),
        )?;

        Ok(TaskHandle { receiver })
    }

    fn schedule_task(&self, delay: Duration, action: Job) -> Result<()> {
        let core = &self.core;
        if core.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(Error::NotRunning);
        }

        let now_ms = core.now_ms();
        let delay_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let task = TimerTask::new(now_ms.saturating_add(delay_ms), now_ms, action);
        trace!(id = task.id(), expires_at_ms = task.expires_at_ms(), "scheduling task");

        if let Some(task) = core.wheel.add_task(task) {
            // Inside the current tick; run it now rather than drop it.
            core.pool.execute(task.into_action())?;
        }
        Ok(())
    }

    /// Whether the scheduler is currently running.
    pub fn is_started(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// The finest wheel's quantized clock, in ms since construction.
    pub fn current_time_ms(&self) -> u64 {
        self.core.wheel.current_time_ms()
    }

    /// Slots per wheel level.
    pub fn wheel_size(&self) -> usize {
        self.core.wheel.wheel_size()
    }

    /// Span of the finest level in ms; longer delays recurse into
    /// automatically created coarser levels.
    pub fn total_span_ms(&self) -> u64 {
        self.core.wheel.interval_ms()
    }

    /// Buckets currently waiting in the expiry queue.
    pub fn pending_buckets(&self) -> usize {
        self.core.queue.len()
    }
}

impl Default for WheelScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for WheelScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Core {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Tick loop: fixed cadence with catch-up, never blocked on the queue or
    /// on user callbacks.
    fn run(core: Arc<Core>) {
        debug!("tick loop running");
        let tick = core.tick;
        let mut next_tick = Instant::now() + tick;

        while core.state.load(Ordering::Acquire) == STATE_RUNNING {
            let now = Instant::now();
            if now < next_tick {
                thread::sleep(next_tick - now);
                continue;
            }

            core.advance_and_drain();

            next_tick += tick;
            if next_tick <= now {
                next_tick = now + tick;
            }
        }
        debug!("tick loop exiting");
    }

    fn advance_and_drain(&self) {
        let now_ms = self.now_ms();
        self.wheel.advance_clock(now_ms);

        let mut drained = 0usize;
        while let Some(bucket) = self.queue.poll_expired(now_ms) {
            drained += 1;
            bucket.flush(|task| self.dispatch(task));
        }
        if drained > 0 {
            trace!(buckets = drained, "drained matured buckets");
        }
    }

    /// Executes a matured task, or cascades an immature one back into the
    /// wheel where it lands at a finer resolution.
    fn dispatch(&self, task: TimerTask) {
        if task.is_expired(self.now_ms()) {
            self.submit(task);
        } else if let Some(task) = self.wheel.add_task(task) {
            // The clock caught up while cascading; it is due after all.
            self.submit(task);
        }
    }

    fn submit(&self, task: TimerTask) {
        let id = task.id();
        if self.pool.execute(task.into_action()).is_err() {
            warn!(id, "callback pool is shut down; dropping task");
        }
    }
}

/// Completion handle returned by [`WheelScheduler::schedule_async`].
///
/// Resolves with the callback's outcome. If the scheduler is stopped before
/// the task matures, the handle resolves with [`Error::NotRunning`] once the
/// discarded task is dropped.
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::NotRunning)),
            Poll::Pending => Poll::Pending,
        }
    }
}
