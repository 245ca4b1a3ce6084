//! Execution pool for user callbacks.
//!
//! Callbacks never run on the tick thread: a fixed set of workers drains a
//! shared job channel, so a slow or blocking callback cannot perturb the
//! tick cadence. A panicking callback is caught and logged at this boundary
//! and never takes a worker down.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::{Error, Result};

/// A unit of callback work.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct CallbackPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CallbackPool {
    /// Spawns `workers` named worker threads (at least one).
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let handles = (0..workers.max(1))
            .map(|index| spawn_worker(index, receiver.clone()))
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Hands a job to the workers. Fails once the pool has shut down.
    pub fn execute(&self, job: Job) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|_| Error::NotRunning),
            None => Err(Error::NotRunning),
        }
    }

    /// Closes the job channel and joins every worker. Idempotent. Jobs that
    /// were already queued still run to completion before the workers exit.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(index: usize, receiver: Receiver<Job>) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("tickwheel-worker-{index}"))
        .spawn(move || {
            while let Ok(job) = receiver.recv() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        worker = index,
                        "scheduled callback panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            trace!(worker = index, "callback worker exiting");
        })
        .expect("failed to spawn callback worker")
}

/// Best-effort rendering of a panic payload for logs and async outcomes.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
