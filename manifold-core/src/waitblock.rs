//! Waitblock: a one-shot, resettable wait point.
//!
//! A thread parks in [`Waitblock::wait`] until another thread, usually an
//! AIO completion callback, calls [`Waitblock::done`]. This is the bridge
//! between the callback-driven core and the blocking API entry points.
//!
//! ```rust
//! use manifold_core::waitblock::Waitblock;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let wb = Arc::new(Waitblock::new());
//! let signal = wb.clone();
//! thread::spawn(move || signal.done());
//! wb.wait();
//! assert!(wb.is_done());
//! ```

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot completion latch, reusable through [`Waitblock::reset`].
#[derive(Debug, Default)]
pub struct Waitblock {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Waitblock {
    /// Create a waitblock in the "not done" state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: parking_lot::const_mutex(false),
            cv: Condvar::new(),
        }
    }

    /// Clear the done flag.
    ///
    /// Callers must ensure no other thread is inside [`wait`](Self::wait)
    /// for the previous cycle.
    pub fn reset(&self) {
        *self.done.lock() = false;
    }

    /// Block until [`done`](Self::done) has been called since the last reset.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// Returns `true` if the waitblock was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut done = self.done.lock();
        while !*done {
            if self.cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    /// Mark the waitblock done and wake every waiter.
    pub fn done(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    /// Current state of the done flag.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_after_done() {
        let wb = Arc::new(Waitblock::new());
        let signaled = Arc::new(AtomicBool::new(false));

        let (wb2, flag) = (wb.clone(), signaled.clone());
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
            wb2.done();
        });

        wb.wait();
        assert!(signaled.load(Ordering::SeqCst), "wait returned before done");
        handle.join().unwrap();
    }

    #[test]
    fn test_spurious_notify_does_not_release_waiter() {
        let wb = Arc::new(Waitblock::new());
        let wb2 = wb.clone();
        let handle = thread::spawn(move || wb2.wait_timeout(Duration::from_millis(100)));

        // Wake the condvar without setting the flag.
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(5));
            wb.cv.notify_all();
        }
        assert!(!handle.join().unwrap(), "waiter released without done");
    }

    #[test]
    fn test_reset_rearms() {
        let wb = Waitblock::new();
        wb.done();
        wb.wait();
        wb.reset();
        assert!(!wb.is_done());
        assert!(!wb.wait_timeout(Duration::from_millis(10)));
        wb.done();
        assert!(wb.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_done_wakes_all_waiters() {
        let wb = Arc::new(Waitblock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let wb = wb.clone();
                thread::spawn(move || wb.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        wb.done();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
