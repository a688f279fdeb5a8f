use thiserror::Error;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// `PoolError` covers every condition a caller of the pool surface
/// can receive synchronously.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool has left its running phase; no new work is admitted.
    #[error("pool is no longer accepting tasks")]
    Closed,

    /// The bounded queue is full and the configured policy rejects
    /// instead of blocking.
    #[error("bounded queue is full and the overflow policy rejects")]
    Rejected,

    /// The bounded queue stayed full past the submission deadline.
    #[error("queue stayed full past the submission deadline")]
    TimedOut,

    /// A worker or supervisor thread could not be spawned.
    #[error("failed to spawn pool thread: {0}")]
    FailedStart(#[from] std::io::Error),
}

impl PoolError {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, PoolError::Closed)
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, PoolError::Rejected)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::TimedOut)
    }
}

/// `TaskError` is the asynchronous outcome of a single submitted task,
/// observable through its [`TaskHandle`]. A task failure never escapes
/// to the pool itself.
///
/// [`TaskHandle`]: crate::TaskHandle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task body panicked; the panic was contained to the task.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was still queued when a discarding shutdown dropped it.
    #[error("task was discarded before running")]
    Discarded,
}
