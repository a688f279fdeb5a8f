// Implements the event record surface where pool failures are reported.

/// The class of event being surfaced. `TaskFailure` is an isolated
/// failure of one submitted task; `WorkerFault` means the pool's own
/// dispatch loop died, which is a different severity altogether.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    TaskFailure,
    WorkerFault,
    WorkerReplaced,
    TasksDiscarded,
}

/// A single reported event: a kind plus a human readable message.
#[derive(Clone, Debug)]
pub struct PoolEvent {
    pub kind: EventKind,
    pub message: String,
}

impl PoolEvent {
    #[must_use]
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// `EventSink` receives every event the pool surfaces. Implementations
/// must tolerate being called from worker and supervisor threads
/// concurrently.
pub trait EventSink: Send + Sync {
    fn report(&self, event: PoolEvent);
}

/// `TracingSink` forwards pool events onto the `tracing` subscriber,
/// mapping task-level noise to warnings and pool-level faults to
/// errors.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn report(&self, event: PoolEvent) {
        match event.kind {
            EventKind::TaskFailure | EventKind::TasksDiscarded => {
                tracing::warn!(kind = ?event.kind, "{}", event.message);
            }
            EventKind::WorkerFault | EventKind::WorkerReplaced => {
                tracing::error!(kind = ?event.kind, "{}", event.message);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::{EventKind, EventSink, PoolEvent};

    /// Sink capturing every reported event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<PoolEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<PoolEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count_of(&self, kind: EventKind) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.kind == kind)
                .count()
        }
    }

    impl EventSink for RecordingSink {
        fn report(&self, event: PoolEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod test_tracing_sink {
    use tracing_test::traced_test;

    use super::{EventKind, EventSink, PoolEvent, TracingSink};

    #[test]
    #[traced_test]
    fn task_failures_surface_as_warnings() {
        let sink = TracingSink;
        sink.report(PoolEvent::new(EventKind::TaskFailure, "task blew up"));

        assert!(logs_contain("task blew up"));
        assert!(logs_contain("WARN"));
    }

    #[test]
    #[traced_test]
    fn worker_faults_surface_as_errors() {
        let sink = TracingSink;
        sink.report(PoolEvent::new(EventKind::WorkerFault, "dispatch loop died"));

        assert!(logs_contain("dispatch loop died"));
        assert!(logs_contain("ERROR"));
    }
}
