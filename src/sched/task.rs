// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Task representation
//!
//! A [`Task`] is the compatibility layer's view of a host thread: something
//! that can be put to sleep and woken up, and that may have a signal pending.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use spin::Once;

use super::kthread::KthreadShared;

/// Task ID type
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Host sleep/wake primitive for one thread
///
/// Semantics match a binary semaphore: `unpark` before `park` makes the next
/// `park` return immediately. `park` may also return spuriously.
pub trait Parker: Send + Sync {
    /// Block the owning thread until unparked or `timeout` passes
    fn park(&self, timeout: Option<Duration>);

    /// Make the owning thread runnable
    fn unpark(&self);
}

/// A schedulable thread of execution
pub struct Task {
    id: TaskId,
    name: String,
    parker: Box<dyn Parker>,
    sigpending: AtomicBool,
    pub(crate) kthread: Once<Arc<KthreadShared>>,
}

impl Task {
    /// Wrap a host thread
    pub fn new(name: &str, parker: Box<dyn Parker>) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            parker,
            sigpending: AtomicBool::new(false),
            kthread: Once::new(),
        }
    }

    /// Unique task ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make the task runnable if it is sleeping
    pub fn wake_up(&self) {
        self.parker.unpark();
    }

    /// Put the calling task to sleep
    ///
    /// Must only be called by the task itself.
    pub(crate) fn sleep(&self, timeout: Option<Duration>) {
        self.parker.park(timeout);
    }

    /// Deliver an asynchronous signal
    ///
    /// Interruptible waits on this task return `Interrupted` until
    /// [`flush_signals`](Self::flush_signals) is called.
    pub fn send_signal(&self) {
        self.sigpending.store(true, Ordering::Release);
        self.wake_up();
    }

    /// Whether a signal is pending
    pub fn signal_pending(&self) -> bool {
        self.sigpending.load(Ordering::Acquire)
    }

    /// Discard pending signals
    pub fn flush_signals(&self) {
        self.sigpending.store(false, Ordering::Release);
    }

    /// Whether this task was created by [`Kthread::run`](super::Kthread::run)
    pub fn is_kthread(&self) -> bool {
        self.kthread.get().is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sigpending", &self.signal_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;

    #[test]
    fn test_task_signal_flags() {
        let task = sched::current();
        assert!(!task.signal_pending());
        task.send_signal();
        assert!(task.signal_pending());
        task.flush_signals();
        assert!(!task.signal_pending());
    }

    #[test]
    fn test_current_is_stable() {
        let a = sched::current();
        let b = sched::current();
        assert_eq!(a.id(), b.id());
        assert!(!a.is_kthread());
    }
}
