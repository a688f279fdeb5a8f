// Implements a Condvar backed gate usable for sleeping threads without CPU burn.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::Waker;

/// `GateState` defines the underlying state of a Condvar based
/// gate which will allow us to sleep a thread silently without
/// eating up CPU cycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateState {
    Open,
    Latched,
    Released,
}

/// Outcome of a bounded wait on a [`GateLatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Released,
    TimedOut,
}

impl WaitOutcome {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut)
    }
}

pub(crate) enum NotifyDirective {
    One,
    All,
}

/// `GateLatch` allows us to sleep a thread or process until a signal
/// gets delivered via its underlying `Condvar`.
///
/// The expected discipline is: `latch` (arm the gate), re-check whatever
/// guard condition you are waiting on, then `wait`. Signals delivered
/// between the latch and the wait are not lost since they move the gate
/// to [`GateState::Released`] which makes the wait return immediately.
pub struct GateLatch {
    /// The condition variable used to wait on the gate,
    /// also provides a way to awake a sleeping thread.
    signal: Condvar,

    /// The mutex protecting the gate state.
    state: Mutex<GateState>,
}

impl Waker for GateLatch {
    fn wake(&self) {
        self.signal_all();
    }
}

impl Default for GateLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl GateLatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: Condvar::new(),
            state: Mutex::new(GateState::Open),
        }
    }

    pub(crate) fn release(&self, directive: NotifyDirective) {
        let mut state = self.state.lock().unwrap();
        *state = GateState::Released;
        drop(state);

        match directive {
            NotifyDirective::One => self.signal.notify_one(),
            NotifyDirective::All => self.signal.notify_all(),
        }
    }

    pub fn probe(&self) -> GateState {
        let current_state = self.state.lock().unwrap();
        current_state.clone()
    }

    pub fn probe_latched(&self) -> bool {
        let current_state = self.state.lock().unwrap();
        *current_state == GateState::Latched
    }

    /// Attempts to put the gate in a latched state thereby
    /// readying you to call [`Self::wait`] after.
    ///
    /// The gate might already be latched by someone else, in
    /// which case this is a no-op and we return false. That is
    /// not an error: you are still free to call [`Self::wait`]
    /// and sleep until the next signal.
    pub fn try_latch(&self) -> bool {
        let mut current_state = self.state.lock().unwrap();
        if *current_state == GateState::Latched {
            return false;
        }
        *current_state = GateState::Latched;
        true
    }

    /// latch arms the gate, treating an already latched
    /// gate as a no-op.
    pub fn latch(&self) {
        let mut current_state = self.state.lock().unwrap();
        if *current_state != GateState::Latched {
            *current_state = GateState::Latched;
        }
    }

    pub fn signal_one(&self) {
        self.release(NotifyDirective::One);
    }

    pub fn signal_all(&self) {
        self.release(NotifyDirective::All);
    }

    /// [`latch_and_wait`] will arm the gate and block the current
    /// thread till it gets a notification to wake up.
    ///
    /// [`latch_and_wait`]: Self::latch_and_wait
    pub fn latch_and_wait(&self) {
        if self.try_latch() {
            tracing::debug!("GateLatch was latched");
        }
        self.wait();
    }

    /// wait blocks the current thread till the gate is released
    /// through [`Self::signal_one`] or [`Self::signal_all`].
    ///
    /// Spurious wake-ups are absorbed here: the state is re-checked
    /// in a loop and only a real release lets the caller continue.
    pub fn wait(&self) {
        let mut current_state = self.state.lock().unwrap();

        // an open gate requires no wait.
        if *current_state == GateState::Open {
            return;
        }

        loop {
            if *current_state == GateState::Released {
                *current_state = GateState::Open;
                return;
            }

            current_state = self.signal.wait(current_state).unwrap();
        }
    }

    /// [`wait_timeout`] blocks like [`Self::wait`] but never past the
    /// given duration. The remaining time is recomputed after every
    /// wake so a spurious wake-up cannot extend the deadline.
    ///
    /// [`wait_timeout`]: Self::wait_timeout
    pub fn wait_timeout(&self, dur: Duration) -> WaitOutcome {
        let started = Instant::now();
        let mut current_state = self.state.lock().unwrap();

        if *current_state == GateState::Open {
            return WaitOutcome::Released;
        }

        loop {
            if *current_state == GateState::Released {
                *current_state = GateState::Open;
                return WaitOutcome::Released;
            }

            let elapsed = started.elapsed();
            if elapsed >= dur {
                return WaitOutcome::TimedOut;
            }

            let (guard, _timeout) = self
                .signal
                .wait_timeout(current_state, dur - elapsed)
                .unwrap();
            current_state = guard;
        }
    }
}
