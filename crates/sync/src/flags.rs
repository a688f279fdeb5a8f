// Implements atomic flag and lifecycle primitives for cooperative shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Indicates the underlying flag has been raised.
const RAISED: usize = 1;

/// Indicates the underlying flag is lowered.
const LOWERED: usize = 0;

/// `StopFlag` is a set-once style atomic flag used to communicate a
/// cooperative stop request across threads.
#[derive(Debug)]
pub struct StopFlag {
    state: AtomicUsize,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(LOWERED),
        }
    }

    /// `raise` flips the flag from lowered to raised, returning
    /// true only for the call that actually performed the flip.
    #[inline]
    pub fn raise(&self) -> bool {
        self.state
            .compare_exchange(LOWERED, RAISED, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// `clear` flips the flag from raised back to lowered.
    #[inline]
    pub fn clear(&self) -> bool {
        self.state
            .compare_exchange(RAISED, LOWERED, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// `is_raised` returns true when the flag has been raised.
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.state.load(Ordering::Acquire) == RAISED
    }
}

/// The component is live and accepting work.
const RUNNING: usize = 0;

/// The component stopped accepting work and is letting
/// pending work finish.
const DRAINING: usize = 1;

/// The component stopped accepting work and is letting go
/// of pending work.
const DISCARDING: usize = 2;

/// The component has fully stopped.
const STOPPED: usize = 3;

/// Lifecycle phase as observed through [`LifecycleSignal::phase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    Running,
    Draining,
    Discarding,
    Stopped,
}

/// `LifecycleSignal` moves a component through its shutdown steps:
///
/// 1. RUNNING = accepting and executing work.
///
/// 2. DRAINING = no new work, pending work still completes.
///
/// 3. DISCARDING = no new work, pending work is dropped.
///
/// 4. STOPPED = fully stopped.
///
/// Transitions only ever move forward; there is no path back to
/// RUNNING once a shutdown phase has been entered.
#[derive(Debug)]
pub struct LifecycleSignal {
    state: AtomicUsize,
}

impl Default for LifecycleSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(RUNNING),
        }
    }

    /// indicative that the component should finish pending work then stop.
    #[inline]
    pub fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// indicative that the component should drop pending work and stop.
    #[inline]
    pub fn begin_discard(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, DISCARDING, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// indicative that the component has fully stopped. Valid from
    /// either shutdown phase, never straight from RUNNING.
    #[inline]
    pub fn finish(&self) -> bool {
        self.state
            .compare_exchange(DRAINING, STOPPED, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
            || self
                .state
                .compare_exchange(DISCARDING, STOPPED, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
    }

    /// `is_accepting` returns true while new work may still be admitted.
    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// `probe_draining` returns true when pending work is being drained.
    #[inline]
    pub fn probe_draining(&self) -> bool {
        self.state.load(Ordering::Acquire) == DRAINING
    }

    /// `probe_discarding` returns true when pending work is being dropped.
    #[inline]
    pub fn probe_discarding(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISCARDING
    }

    /// `probe_stopped` returns true once fully stopped.
    #[inline]
    pub fn probe_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self.state.load(Ordering::Acquire) {
            RUNNING => LifecyclePhase::Running,
            DRAINING => LifecyclePhase::Draining,
            DISCARDING => LifecyclePhase::Discarding,
            _ => LifecyclePhase::Stopped,
        }
    }
}

#[cfg(test)]
mod test_stop_flag {
    use super::StopFlag;

    #[test]
    fn only_first_raise_wins() {
        let flag = StopFlag::new();

        assert!(!flag.is_raised());
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(flag.is_raised());
    }

    #[test]
    fn can_clear_raised_flag() {
        let flag = StopFlag::new();

        assert!(!flag.clear());
        assert!(flag.raise());
        assert!(flag.clear());
        assert!(!flag.is_raised());
    }
}
