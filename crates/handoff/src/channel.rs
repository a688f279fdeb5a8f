// Implements the single slot rendezvous channel with guarded waits.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tandem_sync::Waker;

use crate::{PutError, PutResult, TakeError, TakeResult};

/// The slot plus the liveness and interrupt bookkeeping it is
/// guarded together with. Everything in here sits under one mutex;
/// the condvars outside never touch it without that lock held.
struct Slot<T> {
    /// the pending value; `Some` means occupied.
    value: Option<T>,

    /// live producer handles.
    producers: usize,

    /// live consumer handles.
    consumers: usize,

    /// bumped to abandon waits blocked on the slot vacating.
    put_interrupts: u64,

    /// bumped to abandon waits blocked on the slot filling.
    take_interrupts: u64,
}

/// Which class of blocked callers an interrupt is aimed at. A wake
/// only ever targets the class whose guard condition is involved,
/// never every sleeper on the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaiterClass {
    Producers,
    Consumers,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,

    /// producers sleep here until the slot empties.
    vacated: Condvar,

    /// consumers sleep here until the slot fills.
    occupied: Condvar,
}

impl<T> Inner<T> {
    fn interrupt(&self, class: WaiterClass) {
        let mut slot = self.slot.lock().unwrap();
        match class {
            WaiterClass::Producers => {
                slot.put_interrupts += 1;
                drop(slot);
                tracing::debug!("Interrupting producers blocked on the slot");
                self.vacated.notify_all();
            }
            WaiterClass::Consumers => {
                slot.take_interrupts += 1;
                drop(slot);
                tracing::debug!("Interrupting consumers blocked on the slot");
                self.occupied.notify_all();
            }
        }
    }
}

/// `handoff` creates the single slot channel, handing back the two
/// sides of it. Each side can be cloned and sent across threads, but
/// the slot itself only ever holds one value: a second `put` blocks
/// until a `take` vacates it, which is what enforces the strict
/// put/take alternation.
#[must_use]
pub fn handoff<T>() -> (Producer<T>, Consumer<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(Slot {
            value: None,
            producers: 1,
            consumers: 1,
            put_interrupts: 0,
            take_interrupts: 0,
        }),
        vacated: Condvar::new(),
        occupied: Condvar::new(),
    });

    let producer = Producer {
        inner: inner.clone(),
    };
    let consumer = Consumer { inner };
    (producer, consumer)
}

/// `InterruptHandle` is an opaque wake hook for one waiter class of a
/// handoff channel. Handing one to a supervisor or signal handler lets
/// it abandon a blocked `put`/`take` without owning either side.
pub struct InterruptHandle<T> {
    inner: Arc<Inner<T>>,
    class: WaiterClass,
}

impl<T> Clone for InterruptHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            class: self.class,
        }
    }
}

impl<T> Waker for InterruptHandle<T> {
    fn wake(&self) {
        self.inner.interrupt(self.class);
    }
}

// --- Producer

pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        let mut slot = self.inner.slot.lock().unwrap();
        slot.producers += 1;
        drop(slot);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Producer<T> {
    /// `put` blocks while the slot is occupied, then stores `value`
    /// and wakes one waiting consumer.
    ///
    /// The wait holds no lock while suspended and burns no CPU; a
    /// spurious wake-up simply re-checks the occupancy guard and goes
    /// back to sleep.
    pub fn put(&self, value: T) -> PutResult<T> {
        self.put_inner(value, None)
    }

    /// `put_timeout` behaves like [`Self::put`] but gives up once `dur`
    /// elapses, handing the value back inside [`PutError::TimedOut`]
    /// with the slot left exactly as found.
    pub fn put_timeout(&self, value: T, dur: Duration) -> PutResult<T> {
        self.put_inner(value, Some(dur))
    }

    /// `try_put` stores the value only when the slot is already vacant.
    pub fn try_put(&self, value: T) -> PutResult<T> {
        let mut slot = self.inner.slot.lock().unwrap();

        if slot.consumers == 0 {
            return Err(PutError::Disconnected(value));
        }
        if slot.value.is_some() {
            return Err(PutError::WouldBlock(value));
        }

        slot.value = Some(value);
        drop(slot);
        self.inner.occupied.notify_one();
        Ok(())
    }

    /// `interrupt_waiter` abandons a `take` currently blocked on the
    /// other side; it returns [`TakeError::Cancelled`] instead of
    /// staying suspended. A call made while nobody is blocked affects
    /// no future `take`.
    ///
    /// [`TakeError::Cancelled`]: crate::TakeError::Cancelled
    pub fn interrupt_waiter(&self) {
        self.inner.interrupt(WaiterClass::Consumers);
    }

    /// `interrupt_handle` returns a cloneable [`Waker`] performing
    /// [`Self::interrupt_waiter`].
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle<T> {
        InterruptHandle {
            inner: self.inner.clone(),
            class: WaiterClass::Consumers,
        }
    }

    /// `is_occupied` reports whether a value is currently pending.
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.inner.slot.lock().unwrap().value.is_some()
    }

    fn put_inner(&self, value: T, deadline: Option<Duration>) -> PutResult<T> {
        let started = Instant::now();
        let mut slot = self.inner.slot.lock().unwrap();
        let entry_interrupts = slot.put_interrupts;

        while slot.value.is_some() {
            if slot.consumers == 0 {
                return Err(PutError::Disconnected(value));
            }
            if slot.put_interrupts != entry_interrupts {
                return Err(PutError::Cancelled(value));
            }

            slot = match deadline {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(PutError::TimedOut(value));
                    }
                    let (guard, _timeout) = self
                        .inner
                        .vacated
                        .wait_timeout(slot, limit - elapsed)
                        .unwrap();
                    guard
                }
                None => self.inner.vacated.wait(slot).unwrap(),
            };
        }

        // the slot vacated, but a value is only worth storing while
        // someone is left to take it.
        if slot.consumers == 0 {
            return Err(PutError::Disconnected(value));
        }

        slot.value = Some(value);
        drop(slot);
        self.inner.occupied.notify_one();
        Ok(())
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock().unwrap();
        slot.producers -= 1;
        let last = slot.producers == 0;
        drop(slot);

        if last {
            // consumers blocked on an empty slot will never be fed again.
            self.inner.occupied.notify_all();
        }
    }
}

// --- Consumer

pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        let mut slot = self.inner.slot.lock().unwrap();
        slot.consumers += 1;
        drop(slot);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Consumer<T> {
    /// `take` blocks while the slot is empty, then removes the pending
    /// value, wakes one waiting producer and returns it.
    ///
    /// Like [`Producer::put`] this is a guarded wait: no CPU while
    /// suspended, and every wake re-checks the guard before acting.
    pub fn take(&self) -> TakeResult<T> {
        self.take_inner(None)
    }

    /// `take_timeout` behaves like [`Self::take`] but returns
    /// [`TakeError::TimedOut`] once `dur` elapses, with the slot left
    /// exactly as found.
    pub fn take_timeout(&self, dur: Duration) -> TakeResult<T> {
        self.take_inner(Some(dur))
    }

    /// `try_take` removes the pending value only when one is present.
    pub fn try_take(&self) -> TakeResult<T> {
        let mut slot = self.inner.slot.lock().unwrap();

        match slot.value.take() {
            Some(value) => {
                drop(slot);
                self.inner.vacated.notify_one();
                Ok(value)
            }
            None if slot.producers == 0 => Err(TakeError::Disconnected),
            None => Err(TakeError::WouldBlock),
        }
    }

    /// `interrupt_waiter` abandons a `put` currently blocked on the
    /// other side; it returns [`PutError::Cancelled`] instead of
    /// staying suspended.
    ///
    /// [`PutError::Cancelled`]: crate::PutError::Cancelled
    pub fn interrupt_waiter(&self) {
        self.inner.interrupt(WaiterClass::Producers);
    }

    /// `interrupt_handle` returns a cloneable [`Waker`] performing
    /// [`Self::interrupt_waiter`].
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle<T> {
        InterruptHandle {
            inner: self.inner.clone(),
            class: WaiterClass::Producers,
        }
    }

    /// `is_occupied` reports whether a value is currently pending.
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.inner.slot.lock().unwrap().value.is_some()
    }

    fn take_inner(&self, deadline: Option<Duration>) -> TakeResult<T> {
        let started = Instant::now();
        let mut slot = self.inner.slot.lock().unwrap();
        let entry_interrupts = slot.take_interrupts;

        while slot.value.is_none() {
            // a value already in the slot is still delivered above even
            // when the producer is gone; only an empty slot with no
            // producer left is a dead end.
            if slot.producers == 0 {
                return Err(TakeError::Disconnected);
            }
            if slot.take_interrupts != entry_interrupts {
                return Err(TakeError::Cancelled);
            }

            slot = match deadline {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(TakeError::TimedOut);
                    }
                    let (guard, _timeout) = self
                        .inner
                        .occupied
                        .wait_timeout(slot, limit - elapsed)
                        .unwrap();
                    guard
                }
                None => self.inner.occupied.wait(slot).unwrap(),
            };
        }

        let value = match slot.value.take() {
            Some(value) => value,
            None => unreachable!("guard loop only exits on an occupied slot"),
        };
        drop(slot);
        self.inner.vacated.notify_one();
        Ok(value)
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock().unwrap();
        slot.consumers -= 1;
        let last = slot.consumers == 0;
        drop(slot);

        if last {
            // producers blocked on a full slot will never be drained again.
            self.inner.vacated.notify_all();
        }
    }
}



#[cfg(test)]
mod test_handoff_interrupts {
    use std::{thread, time::Duration};

    use tandem_sync::Waker;

    use super::handoff;
    use crate::TakeError;

    #[test]
    #[ntest::timeout(5000)]
    fn interrupt_abandons_a_blocked_take() {
        let (producer, consumer) = handoff::<u8>();

        let handler = thread::spawn(move || consumer.take());

        // give the take a moment to block before interrupting it.
        thread::sleep(Duration::from_millis(50));
        producer.interrupt_waiter();

        let result = handler.join().expect("should finish");
        assert_eq!(result, Err(TakeError::Cancelled));
    }

    #[test]
    #[ntest::timeout(5000)]
    fn interrupt_abandons_a_blocked_put() {
        let (producer, consumer) = handoff::<u8>();

        producer.put(1).expect("slot starts vacant");

        let handler = thread::spawn(move || producer.put(2));

        thread::sleep(Duration::from_millis(50));
        consumer.interrupt_waiter();

        let err = handler
            .join()
            .expect("should finish")
            .expect_err("wait was interrupted");
        assert!(err.is_cancelled());
        assert_eq!(err.into_value(), 2);

        // the original value is still pending.
        assert_eq!(consumer.take().unwrap(), 1);
    }

    #[test]
    #[ntest::timeout(5000)]
    fn waker_hook_cancels_a_blocked_take() {
        let (producer, consumer) = handoff::<u8>();
        let hook = producer.interrupt_handle();

        let handler = thread::spawn(move || consumer.take());

        thread::sleep(Duration::from_millis(50));
        hook.wake();

        assert_eq!(
            handler.join().expect("should finish"),
            Err(TakeError::Cancelled)
        );
    }

    #[test]
    fn interrupt_with_no_waiter_affects_no_future_call() {
        let (producer, consumer) = handoff::<u8>();

        producer.interrupt_waiter();

        producer.put(5).expect("nothing was interrupted");
        assert_eq!(consumer.take().unwrap(), 5);
    }

    #[test]
    #[tracing_test::traced_test]
    fn interrupts_are_logged() {
        let (producer, _consumer) = handoff::<u8>();

        producer.interrupt_waiter();
        assert!(logs_contain("Interrupting consumers blocked on the slot"));
    }
}

#[cfg(test)]
mod test_handoff_disconnects {
    use std::{thread, time::Duration};

    use super::handoff;
    use crate::TakeError;

    #[test]
    #[ntest::timeout(5000)]
    fn dropping_producer_wakes_a_blocked_take() {
        let (producer, consumer) = handoff::<u8>();

        let handler = thread::spawn(move || consumer.take());

        thread::sleep(Duration::from_millis(50));
        drop(producer);

        assert_eq!(
            handler.join().expect("should finish"),
            Err(TakeError::Disconnected)
        );
    }

    #[test]
    fn pending_value_survives_a_dropped_producer() {
        let (producer, consumer) = handoff::<u8>();

        producer.put(3).expect("slot starts vacant");
        drop(producer);

        // the value already handed over is still delivered.
        assert_eq!(consumer.take().unwrap(), 3);

        // only after the slot drains does the dead peer show.
        assert_eq!(consumer.take(), Err(TakeError::Disconnected));
    }

    #[test]
    #[ntest::timeout(5000)]
    fn dropping_consumer_wakes_a_blocked_put() {
        let (producer, consumer) = handoff::<u8>();

        producer.put(1).expect("slot starts vacant");

        let handler = thread::spawn(move || producer.put(2));

        thread::sleep(Duration::from_millis(50));
        drop(consumer);

        let err = handler
            .join()
            .expect("should finish")
            .expect_err("peer is gone");
        assert!(err.is_disconnected());
    }

    #[test]
    fn put_with_no_consumer_left_is_refused() {
        let (producer, consumer) = handoff::<u8>();
        drop(consumer);

        let err = producer.put(1).expect_err("peer is gone");
        assert!(err.is_disconnected());
        assert_eq!(err.into_value(), 1);
    }
}
