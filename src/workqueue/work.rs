// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Work items
//!
//! A work item is a function plus a small state machine. Every operation
//! (queue, run, cancel, timer expiry) moves the state through a transition
//! table with a single compare-and-swap loop, and acts on the state it
//! moved away from.
//!
//! | State      | Meaning                                            |
//! |------------|----------------------------------------------------|
//! | `IDLE`     | Not queued                                         |
//! | `TIMER`    | Delayed work waiting for its timer                 |
//! | `TASK`     | On a worker FIFO (or marked for rerun)             |
//! | `EXEC`     | Picked up by a worker; stays set after the run     |
//! | `CANCEL`   | Delayed work cancel raced the timer or the worker  |

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

use super::WqShared;

/// ============================================================================
/// Work State
/// ============================================================================

pub(crate) const WORK_ST_IDLE: u8 = 0;
pub(crate) const WORK_ST_TIMER: u8 = 1;
pub(crate) const WORK_ST_TASK: u8 = 2;
pub(crate) const WORK_ST_EXEC: u8 = 3;
pub(crate) const WORK_ST_CANCEL: u8 = 4;
pub(crate) const WORK_ST_MAX: usize = 5;

/// Transition table indexed by the current state
pub(crate) type StateTable = [u8; WORK_ST_MAX];

/// Queueing a work item
pub(crate) const QUEUE_STATES: StateTable = [
    WORK_ST_TASK,  // IDLE: start queuing
    WORK_ST_TIMER, // TIMER: NOP
    WORK_ST_TASK,  // TASK: NOP
    WORK_ST_TASK,  // EXEC: queue another time
    WORK_ST_TASK,  // CANCEL: start queuing again
];

/// Worker picking an item up
pub(crate) const EXEC_STATES: StateTable = [
    WORK_ST_IDLE, // IDLE: NOP
    WORK_ST_EXEC, // TIMER: delayed work without timeout
    WORK_ST_EXEC, // TASK: call callback
    WORK_ST_IDLE, // EXEC: complete callback
    WORK_ST_EXEC, // CANCEL: failed to cancel
];

/// Asynchronous cancel
const CANCEL_STATES: StateTable = [
    WORK_ST_IDLE,  // IDLE: NOP
    WORK_ST_TIMER, // TIMER: handled by delayed work
    WORK_ST_IDLE,  // TASK: cancel
    WORK_ST_EXEC,  // EXEC: NOP
    WORK_ST_IDLE,  // CANCEL: cancel
];

/// Synchronous cancel
pub(crate) const CANCEL_SYNC_STATES: StateTable = [
    WORK_ST_IDLE, // IDLE: NOP
    WORK_ST_IDLE, // TIMER: cancel and drain
    WORK_ST_IDLE, // TASK: cancel and drain
    WORK_ST_IDLE, // EXEC: too late, drain
    WORK_ST_IDLE, // CANCEL: cancel and drain
];

/// Outcome of [`Work::cancel_sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Removed from its queue before it ran
    Canceled,
    /// It was running; the run finished before returning
    WasPending,
    /// Neither queued nor running
    WasIdle,
}

/// ============================================================================
/// Work
/// ============================================================================

/// Function run by a work item
pub type WorkFn = dyn Fn(&Work) + Send + Sync;

pub(crate) struct WorkInner {
    func: Box<WorkFn>,
    state: AtomicU8,
    queue: Mutex<Option<Arc<WqShared>>>,
}

/// Deferred unit of work
///
/// Cloning yields another handle to the same item.
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl Work {
    /// Create an idle work item
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Work) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WorkInner {
                func: Box::new(func),
                state: AtomicU8::new(WORK_ST_IDLE),
                queue: Mutex::new(None),
            }),
        }
    }

    /// Whether two handles name the same item
    pub fn ptr_eq(a: &Work, b: &Work) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn state(&self) -> u8 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// Apply `table` atomically; returns the previous state
    pub(crate) fn update_state(&self, table: &StateTable) -> u8 {
        let mut old = self.inner.state.load(Ordering::Acquire);
        loop {
            let new = table[usize::from(old)];
            if new == old {
                return old;
            }
            match self.inner.state.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return old,
                Err(cur) => old = cur,
            }
        }
    }

    /// Replace `from` by `to` if it is the current state
    pub(crate) fn cmpxchg_state(&self, from: u8, to: u8) {
        let _ = self.inner.state.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn queue(&self) -> Option<Arc<WqShared>> {
        self.inner.queue.lock().clone()
    }

    pub(crate) fn set_queue(&self, wq: &Arc<WqShared>) {
        *self.inner.queue.lock() = Some(wq.clone());
    }

    pub(crate) fn run(&self) {
        (self.inner.func)(self);
    }

    /// Queued, or waiting for its timer
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), WORK_ST_TIMER | WORK_ST_TASK | WORK_ST_CANCEL)
    }

    /// Pending or currently running
    pub fn is_busy(&self) -> bool {
        match self.state() {
            WORK_ST_IDLE => false,
            WORK_ST_EXEC => self.queue().is_some_and(|wq| wq.is_executing(self)),
            _ => true,
        }
    }

    /// Remove the item from its queue without waiting
    ///
    /// Returns `true` if it was queued and will not run. A run that already
    /// started is left alone.
    pub fn cancel(&self) -> bool {
        let Some(wq) = self.queue() else {
            return false;
        };
        let mut exec = wq.exec.lock();
        match self.update_state(&CANCEL_STATES) {
            WORK_ST_TASK | WORK_ST_CANCEL => {
                if exec.is_executing(self) {
                    // Still running: the pending rerun is dropped, the run is not.
                    return false;
                }
                if wq.remove_queued(self) {
                    exec.wake_all();
                }
                true
            }
            _ => false,
        }
    }

    /// Cancel the item and wait for a running instance to finish
    ///
    /// Must not be called from the item's own function.
    pub fn cancel_sync(&self) -> CancelResult {
        let mut result = CancelResult::WasIdle;
        loop {
            let Some(wq) = self.queue() else {
                self.update_state(&CANCEL_SYNC_STATES);
                return result;
            };

            let mut exec = wq.exec.lock();
            match self.update_state(&CANCEL_SYNC_STATES) {
                WORK_ST_IDLE => return result,
                _ => {
                    let removed = wq.remove_queued(self);
                    if removed {
                        exec.wake_all();
                    }
                    let running = exec.is_executing(self);
                    drop(exec);

                    if running {
                        result = CancelResult::WasPending;
                        wq.drain_work(self);
                    } else if removed && result == CancelResult::WasIdle {
                        result = CancelResult::Canceled;
                    }
                    // The function may have queued itself again; retry.
                }
            }
        }
    }

    /// Wait for the last queued instance to finish
    ///
    /// Returns whether there was anything to wait for.
    pub fn flush(&self) -> bool {
        let Some(wq) = self.queue() else {
            return false;
        };
        let busy = self.is_busy();
        wq.drain_work(self);
        busy
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state() {
            WORK_ST_IDLE => "idle",
            WORK_ST_TIMER => "timer",
            WORK_ST_TASK => "queued",
            WORK_ST_EXEC => "exec",
            _ => "cancel",
        };
        f.debug_struct("Work")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tables() {
        let work = Work::new(|_| {});
        assert_eq!(work.update_state(&QUEUE_STATES), WORK_ST_IDLE);
        assert!(work.is_pending());
        // Second queue is a no-op.
        assert_eq!(work.update_state(&QUEUE_STATES), WORK_ST_TASK);
        assert_eq!(work.state(), WORK_ST_TASK);

        assert_eq!(work.update_state(&EXEC_STATES), WORK_ST_TASK);
        assert_eq!(work.state(), WORK_ST_EXEC);
        assert!(!work.is_pending());
        assert_eq!(work.update_state(&EXEC_STATES), WORK_ST_EXEC);
        assert_eq!(work.state(), WORK_ST_IDLE);
    }

    #[test]
    fn test_cancel_unqueued() {
        let work = Work::new(|_| {});
        assert!(!work.cancel());
        assert_eq!(work.cancel_sync(), CancelResult::WasIdle);
        assert!(!work.flush());
        assert!(!work.is_busy());
    }

    #[test]
    fn test_ptr_eq() {
        let a = Work::new(|_| {});
        let b = a.clone();
        let c = Work::new(|_| {});
        assert!(Work::ptr_eq(&a, &b));
        assert!(!Work::ptr_eq(&a, &c));
    }
}
