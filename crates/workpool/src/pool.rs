// Implements the fixed worker pool surface.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use concurrent_queue::{ConcurrentQueue, PushError};
use tandem_sync::{GateLatch, LifecyclePhase, LifecycleSignal, StopFlag};

use crate::tasks::WorkItem;
use crate::workers::{run_supervisor, spawn_worker, PoolShared};
use crate::{
    EventKind, EventSink, OverflowPolicy, PoolConfig, PoolError, PoolEvent, PoolResult,
    QueueBehaviour, TaskHandle,
};

/// `WorkPool` executes submitted tasks on a fixed set of long lived
/// worker threads fed from one shared FIFO queue.
///
/// Dequeue order is FIFO at the queue; completion order across
/// workers is unconstrained. Which blocked thread the underlying
/// mutex wakes first is equally unconstrained: queue fairness and
/// lock fairness are different things and only the former is promised
/// here.
///
/// The pool moves one way through its life: running, then draining or
/// discarding, then stopped. Once it has left the running phase every
/// submission fails with [`PoolError::Closed`].
pub struct WorkPool {
    shared: Arc<PoolShared>,
    overflow: Option<OverflowPolicy>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkPool {
    /// [`start`] spawns exactly `config.workers` named worker threads
    /// plus a supervisor thread, all idle until tasks arrive.
    ///
    /// [`start`]: Self::start
    pub fn start(config: PoolConfig, sink: Arc<dyn EventSink>) -> PoolResult<WorkPool> {
        let span = tracing::trace_span!("WorkPool::start");
        let _enter = span.enter();

        assert!(
            config.workers >= 1,
            "Unable to create WorkPool without workers, please specify >= 1"
        );

        let queue = match config.queue {
            QueueBehaviour::Unbounded => ConcurrentQueue::unbounded(),
            QueueBehaviour::Bounded { capacity, .. } => {
                assert!(
                    capacity >= 1,
                    "Unable to create WorkPool with a zero capacity queue"
                );
                ConcurrentQueue::bounded(capacity)
            }
        };
        let overflow = match config.queue {
            QueueBehaviour::Unbounded => None,
            QueueBehaviour::Bounded { on_full, .. } => Some(on_full),
        };

        let shared = Arc::new(PoolShared {
            queue,
            work_gate: GateLatch::new(),
            space_gate: GateLatch::new(),
            drain_gate: GateLatch::new(),
            lifecycle: LifecycleSignal::new(),
            stop: StopFlag::new(),
            in_flight: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            worker_seq: AtomicUsize::new(1),
            handles: Mutex::new(HashMap::new()),
            sink,
            name_prefix: config.name_prefix.clone(),
        });

        let (activity_sender, activity_receiver) = flume::unbounded();

        for _ in 0..config.workers {
            if let Err(err) = spawn_worker(&shared, &activity_sender) {
                Self::abort_start(&shared);
                return Err(PoolError::FailedStart(err));
            }
        }

        let supervisor_shared = Arc::clone(&shared);
        let supervisor_sender = activity_sender.clone();
        let supervisor = thread::Builder::new()
            .name(format!("{}_supervisor", shared.name_prefix))
            .spawn(move || {
                run_supervisor(supervisor_shared, activity_receiver, supervisor_sender);
            });

        let supervisor = match supervisor {
            Ok(handle) => handle,
            Err(err) => {
                Self::abort_start(&shared);
                return Err(PoolError::FailedStart(err));
            }
        };

        Ok(WorkPool {
            shared,
            overflow,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// `submit` enqueues a task for execution on some worker. The
    /// failure conditions depend on the configured queue: a bounded
    /// queue under the reject policy fails fast with
    /// [`PoolError::Rejected`], under the block policy the caller is
    /// held until a worker frees a slot.
    pub fn submit<F>(&self, job: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(WorkItem::run(Box::new(job), None), None)
    }

    /// `submit_with_handle` enqueues a task and returns a
    /// [`TaskHandle`] resolving to the task's outcome. The submitter
    /// is never blocked waiting for execution; joining the handle is
    /// entirely optional.
    pub fn submit_with_handle<F>(&self, job: F) -> PoolResult<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done, receiver) = flume::bounded(1);
        self.enqueue(WorkItem::run(Box::new(job), Some(done)), None)?;
        Ok(TaskHandle::new(receiver))
    }

    /// `submit_timeout` behaves like [`Self::submit`] but bounds the
    /// time spent blocked on a full queue, failing with
    /// [`PoolError::TimedOut`] once `dur` elapses. Only meaningful
    /// under the block overflow policy.
    pub fn submit_timeout<F>(&self, job: F, dur: Duration) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(WorkItem::run(Box::new(job), None), Some(dur))
    }

    /// `shutdown` stops the pool, one way. With `drain` true every
    /// queued and in-flight task finishes before this returns; with
    /// `drain` false workers stop after at most their current task
    /// and still-queued tasks are discarded: counted, reported
    /// through the sink and resolved on their handles, never silently
    /// dropped.
    ///
    /// Returns [`PoolError::Closed`] when the pool already left its
    /// running phase; there is no path back.
    pub fn shutdown(&self, drain: bool) -> PoolResult<()> {
        let span = tracing::trace_span!("WorkPool::shutdown", drain);
        let _enter = span.enter();

        if drain {
            if !self.shared.lifecycle.begin_drain() {
                return Err(PoolError::Closed);
            }

            // hold until every queued and in-flight task settled.
            loop {
                self.shared.drain_gate.latch();
                if self.shared.queue.is_empty()
                    && self.shared.in_flight.load(std::sync::atomic::Ordering::SeqCst) == 0
                {
                    break;
                }
                self.shared.drain_gate.wait();
            }
        } else if !self.shared.lifecycle.begin_discard() {
            return Err(PoolError::Closed);
        }

        self.shared.stop.raise();
        self.shared.queue.close();

        if !drain {
            let mut discarded = 0usize;
            while let Ok(item) = self.shared.queue.pop() {
                item.discard();
                discarded += 1;
            }

            if discarded > 0 {
                self.shared.sink.report(PoolEvent::new(
                    EventKind::TasksDiscarded,
                    format!("{discarded} queued tasks dropped at shutdown"),
                ));
            }
        }

        self.shared.work_gate.signal_all();
        self.shared.space_gate.signal_all();

        self.join_workers();
        self.join_supervisor();

        self.shared.lifecycle.finish();
        Ok(())
    }

    /// `worker_count` reports the currently observed number of live
    /// workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared
            .live_workers
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// `pending_tasks` reports the number of queued, not yet started
    /// tasks.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    /// `phase` reports where in its lifecycle the pool currently is.
    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        self.shared.lifecycle.phase()
    }

    fn enqueue(&self, item: WorkItem, deadline: Option<Duration>) -> PoolResult<()> {
        let span = tracing::trace_span!("WorkPool::submit");
        let _enter = span.enter();

        if !self.shared.lifecycle.is_accepting() {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let mut item = item;
        loop {
            match self.shared.queue.push(item) {
                Ok(()) => {
                    self.wake_workers();
                    return Ok(());
                }
                Err(PushError::Full(returned)) => {
                    item = returned;
                    match self.overflow {
                        Some(OverflowPolicy::Reject) => return Err(PoolError::Rejected),
                        Some(OverflowPolicy::Block) => {
                            // latch first, then re-check: a slot freed
                            // between the failed push and the wait must
                            // not be slept past.
                            self.shared.space_gate.latch();
                            if !self.shared.lifecycle.is_accepting() {
                                return Err(PoolError::Closed);
                            }
                            if !self.shared.queue.is_full() {
                                continue;
                            }

                            match deadline {
                                Some(limit) => {
                                    let elapsed = started.elapsed();
                                    if elapsed >= limit {
                                        return Err(PoolError::TimedOut);
                                    }
                                    if self
                                        .shared
                                        .space_gate
                                        .wait_timeout(limit - elapsed)
                                        .is_timeout()
                                    {
                                        return Err(PoolError::TimedOut);
                                    }
                                }
                                None => self.shared.space_gate.wait(),
                            }
                        }
                        None => unreachable!("unbounded queue never reports full"),
                    }
                }
                Err(PushError::Closed(_)) => return Err(PoolError::Closed),
            }
        }
    }

    fn wake_workers(&self) {
        if self.shared.queue.len() == 1 {
            self.shared.work_gate.signal_one();
        } else if self.shared.queue.len() > 1 {
            self.shared.work_gate.signal_all();
        }
    }

    /// pulls all worker `JoinHandle`s, joining them till they all
    /// have finished and exited.
    fn join_workers(&self) {
        let worker_keys: Vec<_> = self
            .shared
            .handles
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();

        for worker_id in worker_keys {
            let handle = self.shared.handles.lock().unwrap().remove(&worker_id);
            match handle {
                None => continue,
                Some(worker_handle) => {
                    let _ = worker_handle.join();
                }
            }
        }
    }

    fn join_supervisor(&self) {
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn abort_start(shared: &Arc<PoolShared>) {
        shared.stop.raise();
        shared.queue.close();
        shared.work_gate.signal_all();

        let worker_keys: Vec<_> = shared.handles.lock().unwrap().keys().copied().collect();
        for worker_id in worker_keys {
            let handle = shared.handles.lock().unwrap().remove(&worker_id);
            if let Some(worker_handle) = handle {
                let _ = worker_handle.join();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_dispatch_fault(&self) {
        if self.shared.queue.push(WorkItem::FaultProbe).is_err() {
            panic!("queue should accept the fault probe");
        }
        self.wake_workers();
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        // a pool dropped while still running stops its threads rather
        // than leaking them; queued tasks are discarded and reported.
        if self.shared.lifecycle.is_accepting() {
            let _ = self.shutdown(false);
        }
    }
}

#[cfg(test)]
mod test_pool_execution {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tandem_sync::LifecyclePhase;

    use super::WorkPool;
    use crate::{PoolConfig, TracingSink};

    #[test]
    #[ntest::timeout(10000)]
    fn every_task_runs_exactly_once_with_more_tasks_than_workers() {
        let pool = WorkPool::start(
            PoolConfig::with_workers(4),
            Arc::new(TracingSink),
        )
        .expect("should start pool");

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("should enqueue task");
        }

        pool.shutdown(true).expect("should drain and stop");

        // drained shutdown returned, so all 32 increments are in.
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert_eq!(pool.phase(), LifecyclePhase::Stopped);
    }

    #[test]
    #[ntest::timeout(10000)]
    fn drained_shutdown_waits_for_in_flight_work() {
        let pool = WorkPool::start(
            PoolConfig::with_workers(1),
            Arc::new(TracingSink),
        )
        .expect("should start pool");

        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = counter.clone();
        pool.submit(move || {
            std::thread::sleep(std::time::Duration::from_millis(150));
            task_counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("should enqueue task");

        pool.shutdown(true).expect("should drain and stop");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[ntest::timeout(10000)]
    fn single_worker_preserves_submission_order() {
        let pool = WorkPool::start(
            PoolConfig::with_workers(1),
            Arc::new(TracingSink),
        )
        .expect("should start pool");

        let order = Arc::new(Mutex::new(Vec::new()));
        for value in 0..10 {
            let order = order.clone();
            pool.submit(move || {
                order.lock().unwrap().push(value);
            })
            .expect("should enqueue task");
        }

        pool.shutdown(true).expect("should drain and stop");
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    #[ntest::timeout(10000)]
    fn handles_resolve_once_their_task_completes() {
        let pool = WorkPool::start(
            PoolConfig::with_workers(2),
            Arc::new(TracingSink),
        )
        .expect("should start pool");

        let handle = pool
            .submit_with_handle(|| {})
            .expect("should enqueue task");

        assert_eq!(handle.join(), Ok(()));
        pool.shutdown(true).expect("should drain and stop");
    }

    #[test]
    #[ntest::timeout(10000)]
    fn dropping_a_running_pool_stops_its_threads() {
        let pool = WorkPool::start(
            PoolConfig::with_workers(2),
            Arc::new(TracingSink),
        )
        .expect("should start pool");

        pool.submit(|| {}).expect("should enqueue task");
        drop(pool);
    }
}

#[cfg(test)]
mod test_pool_lifecycle {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::WorkPool;
    use crate::reports::testing::RecordingSink;
    use crate::{EventKind, PoolConfig, TaskError};

    fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + limit;
        while !check() {
            assert!(Instant::now() < deadline, "condition did not hold in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    #[ntest::timeout(10000)]
    fn submitting_after_shutdown_reports_pool_closed() {
        let pool = WorkPool::start(
            PoolConfig::with_workers(2),
            Arc::new(RecordingSink::default()),
        )
        .expect("should start pool");

        pool.shutdown(true).expect("should drain and stop");

        let err = pool.submit(|| {}).expect_err("pool is stopped");
        assert!(err.is_closed());

        // the transition is one-way; a second shutdown reports the same.
        let err = pool.shutdown(true).expect_err("pool is stopped");
        assert!(err.is_closed());
    }

    #[test]
    #[ntest::timeout(10000)]
    fn discarding_shutdown_starts_no_queued_task() {
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkPool::start(PoolConfig::with_workers(2), sink.clone())
            .expect("should start pool");

        let started = Arc::new(AtomicUsize::new(0));

        // occupy both workers with tasks held open by the test.
        let mut releases = Vec::new();
        for _ in 0..2 {
            let (release, held) = mpsc::channel::<()>();
            let started = started.clone();
            pool.submit(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = held.recv();
            })
            .expect("should enqueue blocker");
            releases.push(release);
        }

        wait_until(Duration::from_secs(2), || {
            started.load(Ordering::SeqCst) == 2
        });

        // queue five more; none of them may ever begin.
        let mut handles = Vec::new();
        for _ in 0..5 {
            let started = started.clone();
            handles.push(
                pool.submit_with_handle(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                })
                .expect("should enqueue task"),
            );
        }

        let pool = Arc::new(pool);
        let shutdown_pool = pool.clone();
        let shutdown = thread::spawn(move || shutdown_pool.shutdown(false));

        // let the discard happen, then release the in-flight tasks.
        thread::sleep(Duration::from_millis(50));
        for release in releases {
            let _ = release.send(());
        }

        shutdown
            .join()
            .expect("should finish")
            .expect("should stop pool");

        assert_eq!(started.load(Ordering::SeqCst), 2);
        for handle in handles {
            assert_eq!(handle.join(), Err(TaskError::Discarded));
        }
        assert_eq!(sink.count_of(EventKind::TasksDiscarded), 1);
    }
}


#[cfg(test)]
mod test_pool_failures {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::WorkPool;
    use crate::reports::testing::RecordingSink;
    use crate::{EventKind, PoolConfig, TaskError};

    fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + limit;
        while !check() {
            assert!(Instant::now() < deadline, "condition did not hold in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    #[ntest::timeout(10000)]
    fn task_panic_is_isolated_to_the_task() {
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkPool::start(PoolConfig::with_workers(2), sink.clone())
            .expect("should start pool");

        let handle = pool
            .submit_with_handle(|| panic!("task blew up"))
            .expect("should enqueue task");

        assert_eq!(
            handle.join(),
            Err(TaskError::Panicked(String::from("task blew up")))
        );

        // the worker that absorbed the panic still serves tasks and
        // nothing got replaced.
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = counter.clone();
        let follow_up = pool
            .submit_with_handle(move || {
                task_counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("should enqueue task");

        assert_eq!(follow_up.join(), Ok(()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count_of(EventKind::TaskFailure), 1);
        assert_eq!(sink.count_of(EventKind::WorkerFault), 0);
        assert_eq!(sink.count_of(EventKind::WorkerReplaced), 0);

        pool.shutdown(true).expect("should drain and stop");
    }

    #[test]
    #[ntest::timeout(10000)]
    fn dispatch_fault_replaces_the_worker() {
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkPool::start(PoolConfig::with_workers(1), sink.clone())
            .expect("should start pool");

        pool.inject_dispatch_fault();

        wait_until(Duration::from_secs(5), || {
            sink.count_of(EventKind::WorkerReplaced) == 1
        });
        assert_eq!(sink.count_of(EventKind::WorkerFault), 1);

        // the replacement holds the configured count and serves tasks.
        wait_until(Duration::from_secs(5), || pool.worker_count() == 1);
        let handle = pool
            .submit_with_handle(|| {})
            .expect("should enqueue task");
        assert_eq!(handle.join(), Ok(()));

        pool.shutdown(true).expect("should drain and stop");
    }
}
