// Implements the task container and the optional completion handle.

use std::time::Duration;

use crate::TaskError;

/// A unit of work submitted to the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// `WorkItem` is what actually travels through the queue: the task
/// plus the optional completion side of its handle.
pub(crate) enum WorkItem {
    Run {
        task: Task,
        completion: Option<flume::Sender<Result<(), TaskError>>>,
    },

    /// Test-only probe that panics inside the dispatch loop itself,
    /// outside the unwind boundary protecting task bodies.
    #[cfg(test)]
    FaultProbe,
}

impl WorkItem {
    pub(crate) fn run(task: Task, completion: Option<flume::Sender<Result<(), TaskError>>>) -> Self {
        WorkItem::Run { task, completion }
    }

    /// `discard` resolves the handle of a task that will never run.
    pub(crate) fn discard(self) {
        match self {
            WorkItem::Run {
                completion: Some(done),
                ..
            } => {
                let _ = done.send(Err(TaskError::Discarded));
            }
            WorkItem::Run { .. } => {}
            #[cfg(test)]
            WorkItem::FaultProbe => {}
        }
    }
}

/// `TaskHandle` lets the submitter of a single task observe its
/// outcome without blocking any worker: join waits on a dedicated
/// completion channel, not on the pool.
pub struct TaskHandle {
    receiver: flume::Receiver<Result<(), TaskError>>,
}

impl TaskHandle {
    pub(crate) fn new(receiver: flume::Receiver<Result<(), TaskError>>) -> Self {
        Self { receiver }
    }

    /// `join` blocks until the task finished, panicked or was
    /// discarded.
    pub fn join(&self) -> Result<(), TaskError> {
        match self.receiver.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::Discarded),
        }
    }

    /// `join_timeout` behaves like [`Self::join`] but returns `None`
    /// when the task has not resolved within the given duration.
    pub fn join_timeout(&self, dur: Duration) -> Option<Result<(), TaskError>> {
        match self.receiver.recv_timeout(dur) {
            Ok(outcome) => Some(outcome),
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => Some(Err(TaskError::Discarded)),
        }
    }

    /// `try_join` returns the outcome only when already resolved.
    pub fn try_join(&self) -> Option<Result<(), TaskError>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => Some(Err(TaskError::Discarded)),
        }
    }
}
