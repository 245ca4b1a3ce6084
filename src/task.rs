use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide task id source.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// An immutable scheduling request: an absolute expiration instant plus the
/// callback to run once that instant has passed.
///
/// All times are milliseconds on the owning scheduler's clock (elapsed since
/// the scheduler was constructed). A task is owned by whichever bucket
/// currently holds it; ownership moves on cascade and flush, and
/// [`into_action`](TimerTask::into_action) consumes it for execution.
pub struct TimerTask {
    id: u64,
    expires_at_ms: u64,
    created_at_ms: u64,
    action: Box<dyn FnOnce() + Send + 'static>,
}

impl TimerTask {
    pub fn new(
        expires_at_ms: u64,
        created_at_ms: u64,
        action: Box<dyn FnOnce() + Send + 'static>,
    ) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            expires_at_ms,
            created_at_ms,
            action,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    #[inline]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Whether the expiration instant has passed at `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Consumes the task, yielding its callback for execution.
    #[inline]
    pub fn into_action(self) -> Box<dyn FnOnce() + Send + 'static> {
        self.action
    }
}

impl fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerTask")
            .field("id", &self.id)
            .field("expires_at_ms", &self.expires_at_ms)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TimerTask::new(10, 0, Box::new(|| {}));
        let b = TimerTask::new(10, 0, Box::new(|| {}));
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_expiration_query() {
        let task = TimerTask::new(100, 0, Box::new(|| {}));
        assert!(!task.is_expired(99));
        assert!(task.is_expired(100));
        assert!(task.is_expired(101));
    }

    #[test]
    fn test_into_action_runs_callback() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let task = TimerTask::new(0, 0, Box::new(move || flag.store(true, Ordering::Release)));

        (task.into_action())();
        assert!(fired.load(Ordering::Acquire));
    }
}
