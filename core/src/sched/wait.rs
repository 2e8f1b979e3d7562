//! Blocking wait queues with wakeups.
//!
//! A waiter enqueues its TID, marks itself blocked and re-checks its
//! condition before switching away, which closes the lost-wakeup window.
//! Waiters are removable at any time: a deleted thread simply never comes
//! back for its queue entry, and stale TIDs are skipped on notify.

use alloc::collections::VecDeque;

use kspin::SpinNoIrq;

use super::thread::Tid;

/// A queue of threads waiting for a condition.
pub struct WaitQueue {
    waiters: SpinNoIrq<VecDeque<Tid>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinNoIrq::new(VecDeque::new()),
        }
    }

    fn remove(&self, tid: Tid) {
        self.waiters.lock().retain(|t| *t != tid);
    }

    /// Park until `cond` yields a value. Re-evaluates after every wakeup.
    ///
    /// Outside thread context (early boot) this degrades to halt-and-poll.
    pub fn wait_until<T>(&self, mut cond: impl FnMut() -> Option<T>) -> T {
        loop {
            if let Some(value) = cond() {
                return value;
            }
            let Some(current) = super::current_thread() else {
                crate::arch::halt_until_interrupt();
                continue;
            };
            let tid = current.tid();
            self.waiters.lock().push_back(tid);
            current.set_state(super::ThreadState::Blocked);
            if let Some(value) = cond() {
                current.set_state(super::ThreadState::Running);
                self.remove(tid);
                return value;
            }
            super::yield_now();
            self.remove(tid);
        }
    }

    /// Like [`wait_until`](Self::wait_until), giving up at `deadline_us` on
    /// the monotonic clock. Returns `None` on timeout.
    ///
    /// Nothing wakes a blocked thread when its deadline passes, so a timed
    /// wait stays runnable and yields between checks instead of parking.
    pub fn wait_timeout_until<T>(
        &self,
        deadline_us: u64,
        mut cond: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        loop {
            if let Some(value) = cond() {
                return Some(value);
            }
            if crate::time::monotonic_us() >= deadline_us {
                return None;
            }
            if super::current_thread().is_some() {
                super::yield_now();
            } else {
                crate::arch::halt_until_interrupt();
            }
        }
    }

    /// Wake the longest waiter.
    pub fn notify_one(&self) {
        let tid = self.waiters.lock().pop_front();
        if let Some(tid) = tid {
            super::wake(tid);
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let drained: VecDeque<Tid> = core::mem::take(&mut *self.waiters.lock());
        for tid in drained {
            super::wake(tid);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
