//! Hierarchical timing-wheel scheduler with millisecond-level resolution.
//!
//! Callers schedule an arbitrary number of delayed callbacks with bounded
//! memory and CPU cost, independent of how far in the future each callback
//! fires. The design follows "Hashed and Hierarchical Timing Wheels"
//! (Varghese and Lauck): the finest wheel covers `tick * wheel_size`, and
//! longer delays recurse into lazily created coarser levels whose tasks
//! cascade back down as their expiration approaches.
//!
//! Two thread roles keep slow callbacks from perturbing timing: a dedicated
//! tick thread advances the quantized clock and drains matured buckets, and
//! a separate worker pool executes the callbacks themselves.
//!
//! ```no_run
//! use std::time::Duration;
//! use tickwheel::{SchedulerConfig, WheelScheduler};
//!
//! let scheduler = WheelScheduler::new(SchedulerConfig::default());
//! scheduler.start();
//! scheduler
//!     .schedule(Duration::from_millis(250), || println!("fired"))
//!     .unwrap();
//! scheduler.stop();
//! ```
//!
//! Firing is "no earlier than" with lateness bounded by the tick size and
//! host load; there is no persistence and no cross-process coordination.

pub mod bucket;
pub mod error;
pub mod expiry;
pub mod pool;
pub mod scheduler;
pub mod task;
pub mod wheel;

pub use error::{Error, Result};
pub use scheduler::{SchedulerConfig, TaskHandle, WheelScheduler};
pub use task::TimerTask;
pub use wheel::TimingWheel;
