// Implements the worker dispatch loop and the supervising thread.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use concurrent_queue::{ConcurrentQueue, PopError};
use tandem_sync::{GateLatch, LifecycleSignal, RunOnDrop, StopFlag};

use crate::tasks::WorkItem;
use crate::{EventKind, EventSink, PoolEvent, TaskError};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub(crate) struct WorkerId(pub(crate) usize);

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

pub(crate) enum WorkerActivity {
    /// Indicates when a worker thread has entered its dispatch loop.
    Started(WorkerId),

    /// Indicates when a worker thread has left its dispatch loop cleanly.
    Stopped(WorkerId),

    /// Indicates when the dispatch loop itself died, killing the thread.
    Faulted(WorkerId, Box<dyn Any + Send>),
}

impl core::fmt::Debug for WorkerActivity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WorkerActivity::Started(id) => write!(f, "WorkerActivity::Started({id})"),
            WorkerActivity::Stopped(id) => write!(f, "WorkerActivity::Stopped({id})"),
            WorkerActivity::Faulted(id, _) => write!(f, "WorkerActivity::Faulted({id})"),
        }
    }
}

/// Everything the workers, the supervisor and the pool surface share.
///
/// The gates and the queue are each their own synchronization scope;
/// none of them is ever held while acquiring another, and none of
/// them is ever held across a task body invocation.
pub(crate) struct PoolShared {
    pub(crate) queue: ConcurrentQueue<WorkItem>,

    /// workers sleep here while the queue is empty.
    pub(crate) work_gate: GateLatch,

    /// blocked submitters sleep here while the bounded queue is full.
    pub(crate) space_gate: GateLatch,

    /// a draining shutdown sleeps here until pending work reaches zero.
    pub(crate) drain_gate: GateLatch,

    pub(crate) lifecycle: LifecycleSignal,
    pub(crate) stop: StopFlag,

    /// tasks popped but not yet finished. Incremented before the pop
    /// so the pair (queue empty, zero in flight) can never read true
    /// while a task is being carried out of the queue.
    pub(crate) in_flight: AtomicUsize,

    /// workers currently inside their dispatch loop.
    pub(crate) live_workers: AtomicUsize,

    /// monotonically increasing source of worker names.
    pub(crate) worker_seq: AtomicUsize,

    pub(crate) handles: Mutex<HashMap<WorkerId, JoinHandle<()>>>,

    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) name_prefix: String,
}

/// `spawn_worker` stands up one named worker thread running the
/// dispatch loop, registering its join handle with the pool.
pub(crate) fn spawn_worker(
    shared: &Arc<PoolShared>,
    activity: &flume::Sender<WorkerActivity>,
) -> std::io::Result<WorkerId> {
    let id = WorkerId(shared.worker_seq.fetch_add(1, Ordering::SeqCst));
    let thread_name = format!("{}_{}", shared.name_prefix, id);
    let builder = thread::Builder::new().name(thread_name);

    let loop_shared = Arc::clone(shared);
    let sender = activity.clone();
    let handle = builder.spawn(move || {
        sender
            .send(WorkerActivity::Started(id))
            .expect("should send activity");

        match panic::catch_unwind(AssertUnwindSafe(|| run_dispatch_loop(&loop_shared, id))) {
            Ok(()) => sender
                .send(WorkerActivity::Stopped(id))
                .expect("should send activity"),
            Err(payload) => sender
                .send(WorkerActivity::Faulted(id, payload))
                .expect("should send activity"),
        }
    })?;

    shared.handles.lock().unwrap().insert(id, handle);
    Ok(id)
}

fn run_dispatch_loop(shared: &Arc<PoolShared>, id: WorkerId) {
    let span = tracing::trace_span!("WorkPool::dispatch", worker = id.0);
    let _enter = span.enter();

    loop {
        if shared.stop.is_raised() {
            break;
        }

        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        match shared.queue.pop() {
            Ok(item) => {
                // the counter must come back down even when the
                // dispatch path below unwinds.
                let _settle = RunOnDrop::new(|| {
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    notify_drain_progress(shared);
                });

                if shared.queue.capacity().is_some() {
                    shared.space_gate.signal_one();
                }

                execute(shared, id, item);
            }
            Err(PopError::Empty) => {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                notify_drain_progress(shared);

                // latch first, then re-check: a task pushed between
                // the failed pop and the wait must not be slept past.
                shared.work_gate.latch();
                if !shared.queue.is_empty() || shared.stop.is_raised() {
                    continue;
                }
                shared.work_gate.wait();
            }
            Err(PopError::Closed) => {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        }
    }
}

/// Wakes a draining shutdown once the last pending task settles.
fn notify_drain_progress(shared: &PoolShared) {
    if shared.lifecycle.probe_draining()
        && shared.queue.is_empty()
        && shared.in_flight.load(Ordering::SeqCst) == 0
    {
        shared.drain_gate.signal_all();
    }
}

fn execute(shared: &PoolShared, id: WorkerId, item: WorkItem) {
    match item {
        WorkItem::Run { task, completion } => {
            match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(()) => {
                    if let Some(done) = completion {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    shared.sink.report(PoolEvent::new(
                        EventKind::TaskFailure,
                        format!("task on {id} panicked: {reason}"),
                    ));
                    if let Some(done) = completion {
                        let _ = done.send(Err(TaskError::Panicked(reason)));
                    }
                }
            }
        }
        #[cfg(test)]
        WorkItem::FaultProbe => panic!("fault probe reached the dispatch loop"),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("opaque panic payload")
    }
}

/// `run_supervisor` drains the activity channel: it keeps the live
/// worker count, reaps faulted workers and stands up replacements so
/// the configured worker count holds until shutdown.
pub(crate) fn run_supervisor(
    shared: Arc<PoolShared>,
    receiver: flume::Receiver<WorkerActivity>,
    sender: flume::Sender<WorkerActivity>,
) {
    let span = tracing::trace_span!("WorkPool::supervisor");
    let _enter = span.enter();

    while let Ok(activity) = receiver.recv() {
        match activity {
            WorkerActivity::Started(id) => {
                tracing::debug!("Worker {} started", id);
                shared.live_workers.fetch_add(1, Ordering::SeqCst);
            }
            WorkerActivity::Stopped(id) => {
                tracing::debug!("Worker {} stopped", id);
                let remaining = shared.live_workers.fetch_sub(1, Ordering::SeqCst) - 1;
                if shared.stop.is_raised() && remaining == 0 {
                    break;
                }
            }
            WorkerActivity::Faulted(id, payload) => {
                let remaining = shared.live_workers.fetch_sub(1, Ordering::SeqCst) - 1;
                shared.sink.report(PoolEvent::new(
                    EventKind::WorkerFault,
                    format!("{id} dispatch loop died: {}", panic_message(payload.as_ref())),
                ));

                // reap the dead thread before standing up its successor.
                let corpse = shared.handles.lock().unwrap().remove(&id);
                if let Some(handle) = corpse {
                    let _ = handle.join();
                }

                if shared.stop.is_raised() {
                    if remaining == 0 {
                        break;
                    }
                    continue;
                }

                match spawn_worker(&shared, &sender) {
                    Ok(replacement) => {
                        shared.sink.report(PoolEvent::new(
                            EventKind::WorkerReplaced,
                            format!("{id} replaced by {replacement}"),
                        ));
                    }
                    Err(err) => {
                        tracing::error!("Failed to spawn replacement for {}: {}", id, err);
                        if remaining == 0 {
                            break;
                        }
                    }
                }
            }
        }
    }
}
