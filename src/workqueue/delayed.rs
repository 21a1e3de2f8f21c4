// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Delayed Work
//!
//! A work item plus a [`Timer`]. Queuing arms the timer; expiry moves the
//! item onto its queue. Queue, expiry and cancel are serialized by a
//! per-item lock so the timer and the queue never disagree on the state.

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::time::Duration;
use spin::Mutex;

use super::work::{
    CancelResult, StateTable, Work, CANCEL_SYNC_STATES, WORK_ST_CANCEL, WORK_ST_EXEC, WORK_ST_IDLE, WORK_ST_TASK,
    WORK_ST_TIMER,
};
use super::{WorkQueue, WqShared};
use crate::timer::Timer;

/// Queueing with a delay
const QUEUE_DELAYED_STATES: StateTable = [
    WORK_ST_TIMER, // IDLE: start timeout
    WORK_ST_TIMER, // TIMER: NOP
    WORK_ST_TASK,  // TASK: NOP
    WORK_ST_TIMER, // EXEC: start timeout
    WORK_ST_TIMER, // CANCEL: start timeout
];

/// Timer expiry
const TIMER_STATES: StateTable = [
    WORK_ST_IDLE,  // IDLE: NOP
    WORK_ST_TASK,  // TIMER: enqueue
    WORK_ST_TASK,  // TASK: NOP
    WORK_ST_EXEC,  // EXEC: NOP
    WORK_ST_TASK,  // CANCEL: enqueue
];

/// Asynchronous cancel
const CANCEL_DELAYED_STATES: StateTable = [
    WORK_ST_IDLE,   // IDLE: NOP
    WORK_ST_CANCEL, // TIMER: try to cancel
    WORK_ST_CANCEL, // TASK: try to cancel
    WORK_ST_EXEC,   // EXEC: NOP
    WORK_ST_CANCEL, // CANCEL: NOP
];

struct DelayedInner {
    work: Work,
    timer: Timer,
    lock: Mutex<()>,
}

/// Work that runs after a delay
///
/// The item only runs while some handle to it is alive; drop it after
/// [`DelayedWork::cancel_sync`].
#[derive(Clone)]
pub struct DelayedWork {
    inner: Arc<DelayedInner>,
}

impl DelayedWork {
    /// Create an idle delayed work item
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&DelayedWork) + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|weak: &Weak<DelayedInner>| {
            let run = weak.clone();
            let work = Work::new(move |_| {
                if let Some(inner) = run.upgrade() {
                    func(&DelayedWork { inner });
                }
            });
            let expire = weak.clone();
            let timer = Timer::new(move || {
                if let Some(inner) = expire.upgrade() {
                    DelayedWork { inner }.timer_fired();
                }
            });
            DelayedInner {
                work,
                timer,
                lock: Mutex::new(()),
            }
        });
        Self { inner }
    }

    /// The underlying work item
    pub fn work(&self) -> &Work {
        &self.inner.work
    }

    /// Queue on `wq` after `delay`
    ///
    /// Returns `false` if already pending. A zero delay queues right away.
    pub fn queue(&self, wq: &WorkQueue, delay: Duration) -> bool {
        self.queue_shared(&wq.shared, delay)
    }

    fn queue_shared(&self, wq: &Arc<WqShared>, delay: Duration) -> bool {
        if wq.refuses_work() {
            log::warn!("workqueue {}: delayed queuing refused while draining or destroyed", wq.name);
            return false;
        }

        let work = &self.inner.work;
        let _guard = self.inner.lock.lock();
        match work.update_state(&QUEUE_DELAYED_STATES) {
            WORK_ST_EXEC | WORK_ST_CANCEL => {
                if delay.is_zero() && wq.exec_unblock(work) {
                    return true;
                }
                self.start(wq, delay);
                true
            }
            WORK_ST_IDLE => {
                self.start(wq, delay);
                true
            }
            _ => false,
        }
    }

    fn start(&self, wq: &Arc<WqShared>, delay: Duration) {
        let work = &self.inner.work;
        work.set_queue(wq);
        if delay.is_zero() {
            wq.enqueue(work, None);
        } else {
            self.inner.timer.arm(delay);
        }
    }

    fn timer_fired(&self) {
        let work = &self.inner.work;
        let _guard = self.inner.lock.lock();
        if !matches!(work.update_state(&TIMER_STATES), WORK_ST_TIMER | WORK_ST_CANCEL) {
            return;
        }
        let Some(wq) = work.queue() else {
            work.cmpxchg_state(WORK_ST_TASK, WORK_ST_IDLE);
            return;
        };

        let mut exec = wq.exec.lock();
        if wq.refuses_work() {
            log::warn!("workqueue {}: expired delayed work dropped, queue draining or destroyed", wq.name);
            work.cmpxchg_state(WORK_ST_TASK, WORK_ST_IDLE);
            exec.wake_all();
            return;
        }
        wq.enqueue(work, None);
    }

    /// Re-queue with a new delay
    ///
    /// Returns whether the item was pending before.
    pub fn modify(&self, wq: &WorkQueue, delay: Duration) -> bool {
        let was_pending = self.cancel();
        self.queue(wq, delay);
        was_pending
    }

    /// Stop the timer or take the item off its queue without waiting
    ///
    /// Returns `true` if the pending run will not happen.
    pub fn cancel(&self) -> bool {
        let work = &self.inner.work;
        let _guard = self.inner.lock.lock();
        let old = work.update_state(&CANCEL_DELAYED_STATES);

        if matches!(old, WORK_ST_TIMER | WORK_ST_CANCEL) && self.inner.timer.cancel() {
            work.cmpxchg_state(WORK_ST_CANCEL, WORK_ST_IDLE);
            return true;
        }
        if !matches!(old, WORK_ST_TIMER | WORK_ST_TASK | WORK_ST_CANCEL) {
            return false;
        }

        // The timer already fired; fall back to the queue.
        let Some(wq) = work.queue() else {
            return false;
        };
        let mut exec = wq.exec.lock();
        if exec.is_executing(work) {
            return false;
        }
        if wq.remove_queued(work) {
            exec.wake_all();
        }
        work.cmpxchg_state(WORK_ST_CANCEL, WORK_ST_IDLE);
        true
    }

    /// Cancel and wait for the timer callback and a running instance
    pub fn cancel_sync(&self) -> CancelResult {
        let work = &self.inner.work;
        let mut result = CancelResult::WasIdle;
        loop {
            let guard = self.inner.lock.lock();
            match work.update_state(&CANCEL_SYNC_STATES) {
                WORK_ST_IDLE => return result,
                WORK_ST_EXEC => drop(guard),
                _ => {
                    if self.inner.timer.cancel() {
                        result = CancelResult::Canceled;
                    }
                    drop(guard);
                    // An expiry already in flight finds the item idle.
                    self.inner.timer.cancel_sync();
                }
            }

            let Some(wq) = work.queue() else {
                continue;
            };
            let mut exec = wq.exec.lock();
            let removed = wq.remove_queued(work);
            if removed {
                exec.wake_all();
            }
            let running = exec.is_executing(work);
            drop(exec);

            if running {
                result = CancelResult::WasPending;
                wq.drain_work(work);
            } else if removed && result == CancelResult::WasIdle {
                result = CancelResult::Canceled;
            }
        }
    }

    /// Run a pending item now and wait for it
    ///
    /// Returns whether there was anything to wait for.
    pub fn flush(&self) -> bool {
        let fired_now = {
            let _guard = self.inner.lock.lock();
            self.inner.timer.cancel()
        };
        if fired_now {
            self.timer_fired();
        } else {
            self.inner.timer.cancel_sync();
        }
        self.inner.work.flush() || fired_now
    }

    /// Waiting for its timer or queued
    pub fn is_pending(&self) -> bool {
        self.inner.work.is_pending()
    }

    /// Pending or running
    pub fn is_busy(&self) -> bool {
        self.inner.work.is_busy()
    }
}

impl fmt::Debug for DelayedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedWork")
            .field("work", &self.inner.work)
            .field("timer", &self.inner.timer)
            .finish()
    }
}
