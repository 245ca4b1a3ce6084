use thiserror::Error;

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the wheel scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The scheduler has not been started, or has already been stopped.
    #[error("scheduler is not running")]
    NotRunning,

    /// A user callback panicked while executing.
    #[error("scheduled callback panicked: {0}")]
    CallbackPanicked(String),
}
