//! Scheduler Contract
//!
//! The task-scheduling engine lives in the host runtime; the dataplane
//! only consumes its contract. A task bound to a worker thread can be
//! rescheduled (normally or without delay), armed on a timer, or
//! parked on write-readiness of a hardware queue. Adapters hold these
//! hooks and never block a thread on I/O themselves.

use std::time::Duration;

/// Hooks a schedulable task exposes to the components it drives.
pub trait TaskHook: Send + Sync {
    /// Request another run of the task.
    fn reschedule(&self);

    /// Request another run without scheduling delay (busy-poll).
    fn fast_reschedule(&self);

    /// Request a run after `delay`.
    fn schedule_after(&self, delay: Duration);

    /// Wake the task when TX queue `queue` has writable descriptors.
    fn watch_writable(&self, queue: usize);

    /// Stop watching TX queue `queue`.
    fn unwatch_writable(&self, queue: usize);
}

/// A one-shot deferred timer, used to throttle TX ring
/// synchronization.
pub trait SyncTimer: Send + Sync {
    /// Arm the timer `delay` from now if not already armed.
    fn schedule_after(&self, delay: Duration);

    /// Whether the timer is currently armed.
    fn scheduled(&self) -> bool;
}

/// Spin until `attempt` reports success, invoking `on_contention`
/// after each failure and pausing the core between tries.
///
/// The exit condition is solely the success of `attempt`: callers
/// choosing a blocking policy trade a busy core for backpressure, and
/// the hook is their chance to prod whoever must make progress.
#[inline]
pub fn spin_retry(mut attempt: impl FnMut() -> bool, mut on_contention: impl FnMut()) {
    while !attempt() {
        on_contention();
        std::hint::spin_loop();
    }
}

/// No-op task hook for components driven entirely by explicit calls.
pub struct NullTask;

impl TaskHook for NullTask {
    fn reschedule(&self) {}
    fn fast_reschedule(&self) {}
    fn schedule_after(&self, _delay: Duration) {}
    fn watch_writable(&self, _queue: usize) {}
    fn unwatch_writable(&self, _queue: usize) {}
}

/// No-op timer.
pub struct NullTimer;

impl SyncTimer for NullTimer {
    fn schedule_after(&self, _delay: Duration) {}
    fn scheduled(&self) -> bool {
        false
    }
}


#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records every hook invocation for assertions.
    #[derive(Default)]
    pub struct RecordingTask {
        pub resched: AtomicUsize,
        pub fast: AtomicUsize,
        pub delays: Mutex<Vec<Duration>>,
        pub watched: Mutex<Vec<usize>>,
        pub unwatched: Mutex<Vec<usize>>,
    }

    impl TaskHook for RecordingTask {
        fn reschedule(&self) {
            self.resched.fetch_add(1, Ordering::Relaxed);
        }

        fn fast_reschedule(&self) {
            self.fast.fetch_add(1, Ordering::Relaxed);
        }

        fn schedule_after(&self, delay: Duration) {
            self.delays.lock().push(delay);
        }

        fn watch_writable(&self, queue: usize) {
            self.watched.lock().push(queue);
        }

        fn unwatch_writable(&self, queue: usize) {
            self.unwatched.lock().push(queue);
        }
    }

    #[derive(Default)]
    pub struct RecordingTimer {
        pub armed: Mutex<Vec<Duration>>,
        pub pending: AtomicBool,
    }

    impl SyncTimer for RecordingTimer {
        fn schedule_after(&self, delay: Duration) {
            self.armed.lock().push(delay);
            self.pending.store(true, Ordering::Relaxed);
        }

        fn scheduled(&self) -> bool {
            self.pending.load(Ordering::Relaxed)
        }
    }

    impl RecordingTimer {
        /// Simulate the timer firing.
        pub fn fire(&self) {
            self.pending.store(false, Ordering::Relaxed);
        }
    }
}
