// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Threads
//!
//! Thin lifecycle layer over host threads: create, park/unpark and stop.
//! Workqueue workers and the timer service run on these.
//!
//! # Usage
//!
//! ```ignore
//! let thread = Kthread::run("worker", || {
//!     while !kthread::should_stop() {
//!         if kthread::should_park() {
//!             kthread::parkme();
//!         }
//!         do_work();
//!     }
//!     0
//! })?;
//!
//! let ret = thread.stop();
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, Once};

use super::task::Task;
use crate::error::{errno, Error, Result};
use crate::sched;
use crate::sync::Completion;

bitflags! {
    /// Kernel thread control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KthreadFlags: u32 {
        /// `stop` was requested
        const SHOULD_STOP = 1 << 0;
        /// `park` was requested
        const SHOULD_PARK = 1 << 1;
        /// Thread sits in `parkme`
        const IS_PARKED = 1 << 2;
        /// Thread function returned
        const EXITED = 1 << 3;
    }
}

/// State shared between a [`Kthread`] handle and the thread itself
pub(crate) struct KthreadShared {
    flags: AtomicU32,
    parked: Completion,
    exited: Completion,
    result: Mutex<Option<i32>>,
    task: Once<Arc<Task>>,
}

impl KthreadShared {
    fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            parked: Completion::new(),
            exited: Completion::new(),
            result: Mutex::new(None),
            task: Once::new(),
        }
    }

    fn test(&self, flag: KthreadFlags) -> bool {
        KthreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    fn set(&self, flag: KthreadFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        KthreadFlags::from_bits_truncate(old).contains(flag)
    }

    fn clear(&self, flag: KthreadFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        KthreadFlags::from_bits_truncate(old).contains(flag)
    }
}

/// Handle to a running kernel thread
///
/// Dropping the handle stops the thread.
pub struct Kthread {
    shared: Arc<KthreadShared>,
    task: Arc<Task>,
    stopped: Option<i32>,
}

impl Kthread {
    /// Create a kernel thread and start it
    ///
    /// Returns once the thread is running. If the thread is stopped before
    /// `f` gets a chance to run, `f` is skipped and `stop` returns `-EINTR`.
    pub fn run<F>(name: &str, f: F) -> Result<Self>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let shared = Arc::new(KthreadShared::new());
        let started = Arc::new(Completion::new());

        let thread_shared = shared.clone();
        let thread_started = started.clone();
        sched::host().spawn(
            name,
            Box::new(move || {
                let me = sched::current();
                me.kthread.call_once(|| thread_shared.clone());
                thread_shared.task.call_once(|| me.clone());
                thread_started.complete();

                let ret = if thread_shared.test(KthreadFlags::SHOULD_STOP) {
                    -errno::EINTR
                } else {
                    f()
                };

                *thread_shared.result.lock() = Some(ret);
                thread_shared.set(KthreadFlags::EXITED);
                thread_shared.exited.complete_all();
            }),
        )?;

        started.wait();
        let task = shared.task.get().cloned().ok_or(Error::Busy)?;
        log::debug!("kthread: started {} (task {})", name, task.id());

        Ok(Self {
            shared,
            task,
            stopped: None,
        })
    }

    /// The thread's task
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Ask the thread to park and wait until it did
    ///
    /// Returns `Busy` if a park is already pending and `InvalidArgument`
    /// once the thread exited.
    pub fn park(&self) -> Result<()> {
        if self.shared.test(KthreadFlags::EXITED) {
            return Err(Error::InvalidArgument);
        }
        if self.shared.test(KthreadFlags::SHOULD_PARK) {
            return Err(Error::Busy);
        }
        self.shared.parked.reinit();
        self.shared.set(KthreadFlags::SHOULD_PARK);
        self.task.wake_up();
        self.shared.parked.wait();
        Ok(())
    }

    /// Let a parked thread continue
    pub fn unpark(&self) {
        self.shared.clear(KthreadFlags::SHOULD_PARK);
        self.task.wake_up();
    }

    /// Whether the thread currently sits in [`parkme`]
    pub fn is_parked(&self) -> bool {
        self.shared.test(KthreadFlags::IS_PARKED)
    }

    /// Whether the thread function returned
    pub fn has_exited(&self) -> bool {
        self.shared.test(KthreadFlags::EXITED)
    }

    /// Stop the thread and return its exit code
    ///
    /// The thread function must poll [`should_stop`].
    pub fn stop(mut self) -> i32 {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> i32 {
        if let Some(ret) = self.stopped {
            return ret;
        }
        self.shared.set(KthreadFlags::SHOULD_STOP);
        self.unpark();
        self.shared.exited.wait();

        let ret = self.shared.result.lock().unwrap_or(-errno::EINTR);
        log::debug!("kthread: stopped {} -> {}", self.task.name(), ret);
        self.stopped = Some(ret);
        ret
    }
}

impl Drop for Kthread {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

impl fmt::Debug for Kthread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kthread")
            .field("task", &self.task)
            .field("flags", &KthreadFlags::from_bits_truncate(self.shared.flags.load(Ordering::Relaxed)))
            .finish()
    }
}

/// ============================================================================
/// Thread-side helpers
/// ============================================================================

fn with_self<R>(f: impl FnOnce(&KthreadShared) -> R) -> Option<R> {
    let task = sched::current();
    task.kthread.get().map(|k| f(k))
}

/// Whether the calling kthread was asked to stop
///
/// Always false for threads not created by [`Kthread::run`].
pub fn should_stop() -> bool {
    with_self(|k| k.test(KthreadFlags::SHOULD_STOP)).unwrap_or(false)
}

/// Whether the calling kthread was asked to park
pub fn should_park() -> bool {
    with_self(|k| k.test(KthreadFlags::SHOULD_PARK)).unwrap_or(false)
}

/// Sleep while a park is requested
pub fn parkme() {
    let task = sched::current();
    let Some(k) = task.kthread.get() else {
        return;
    };
    while k.test(KthreadFlags::SHOULD_PARK) {
        if !k.set(KthreadFlags::IS_PARKED) {
            k.parked.complete_all();
        }
        task.sleep(None);
    }
    k.clear(KthreadFlags::IS_PARKED);
}
