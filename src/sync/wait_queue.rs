// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Wait Queue
//!
//! This module provides wait queues for the compatibility layer. A wait
//! queue owns the state its waiters are interested in (`S`), so the
//! condition check, the waiter registration and the wakeup all happen under
//! one lock.
//!
//! # Design
//!
//! - **FIFO**: Entries are woken in registration order
//! - **Wake functions**: Each entry decides what "waking" means; the default
//!   unparks the waiting task
//! - **Autoremove**: An entry whose wake function reports success is unlinked
//!   and re-registered by its waiter if the condition is still false
//!
//! # Usage
//!
//! ```ignore
//! let wq: WaitQueue<bool> = WaitQueue::with_state(false);
//!
//! // Consumer
//! wq.wait_event(|ready| *ready);
//!
//! // Producer
//! let mut state = wq.lock();
//! *state = true;
//! state.wake_all();
//! ```

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use spin::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::sched::{self, Task};

/// ============================================================================
/// Wait Queue Entry
/// ============================================================================

/// Custom wake function
///
/// Called with the queue lock held; must not touch the same queue.
/// Returns whether the entry counts as woken.
pub type WakeFn = dyn Fn(&WaitQueueEntry) -> bool + Send + Sync;

/// A waiter registered on a [`WaitQueue`]
pub struct WaitQueueEntry {
    task: Arc<Task>,
    func: Option<Box<WakeFn>>,
    linked: AtomicBool,
}

impl WaitQueueEntry {
    /// Entry that wakes `task`
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            func: None,
            linked: AtomicBool::new(false),
        }
    }

    /// Entry for the calling task
    pub fn for_current() -> Self {
        Self::new(sched::current())
    }

    /// Entry with a custom wake function
    pub fn with_wake_fn<F>(task: Arc<Task>, func: F) -> Self
    where
        F: Fn(&WaitQueueEntry) -> bool + Send + Sync + 'static,
    {
        Self {
            task,
            func: Some(Box::new(func)),
            linked: AtomicBool::new(false),
        }
    }

    /// The waiting task
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Whether the entry is on a queue
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    fn wake(&self) -> bool {
        match &self.func {
            Some(func) => func(self),
            None => default_wake_function(self),
        }
    }
}

impl fmt::Debug for WaitQueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueueEntry")
            .field("task", &self.task.id())
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Wake function used by entries without a custom one
pub fn default_wake_function(entry: &WaitQueueEntry) -> bool {
    entry.task.wake_up();
    true
}

/// ============================================================================
/// Wait Queue
/// ============================================================================

struct Inner<S> {
    state: S,
    waiters: VecDeque<Arc<WaitQueueEntry>>,
}

impl<S> Inner<S> {
    fn add(&mut self, entry: &Arc<WaitQueueEntry>) {
        let was_linked = entry.linked.swap(true, Ordering::AcqRel);
        debug_assert!(!was_linked, "wait queue entry added twice");
        if !was_linked {
            self.waiters.push_back(entry.clone());
        }
    }

    fn remove(&mut self, entry: &Arc<WaitQueueEntry>) -> bool {
        if !entry.is_linked() {
            return false;
        }
        match self.waiters.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(pos) => {
                self.waiters.remove(pos);
                entry.linked.store(false, Ordering::Release);
                true
            }
            // Linked on some other queue.
            None => false,
        }
    }

    fn wake(&mut self, nr: usize) -> usize {
        let mut woken = 0;
        let mut pos = 0;
        while woken < nr && pos < self.waiters.len() {
            let entry = self.waiters[pos].clone();
            if entry.wake() {
                self.waiters.remove(pos);
                entry.linked.store(false, Ordering::Release);
                woken += 1;
            } else {
                pos += 1;
            }
        }
        woken
    }
}

/// Queue of tasks waiting on a condition over `S`
pub struct WaitQueue<S = ()> {
    inner: Mutex<Inner<S>>,
}

impl WaitQueue<()> {
    /// Create a wait queue without state
    pub const fn new() -> Self {
        Self::with_state(())
    }
}

impl<S> WaitQueue<S> {
    /// Create a wait queue guarding `state`
    pub const fn with_state(state: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Register `entry`
    ///
    /// An entry may only be on one queue at a time.
    pub fn add(&self, entry: &Arc<WaitQueueEntry>) {
        self.inner.lock().add(entry);
    }

    /// Unregister `entry`; returns whether it was on this queue
    pub fn remove(&self, entry: &Arc<WaitQueueEntry>) -> bool {
        self.inner.lock().remove(entry)
    }

    /// Wake up to `nr` entries in FIFO order; returns how many woke
    pub fn wake(&self, nr: usize) -> usize {
        self.inner.lock().wake(nr)
    }

    /// Wake every entry
    pub fn wake_all(&self) -> usize {
        self.wake(usize::MAX)
    }

    /// Whether any entry is registered
    pub fn is_active(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Lock the queue to inspect or update its state
    pub fn lock(&self) -> WaitQueueGuard<'_, S> {
        WaitQueueGuard {
            inner: self.inner.lock(),
        }
    }

    /// Block until `cond` holds
    pub fn wait_event<F>(&self, cond: F)
    where
        F: FnMut(&mut S) -> bool,
    {
        // Without a timeout or signals the only way out is the condition.
        let _ = self.wait_common(false, None, cond);
    }

    /// Block until `cond` holds or `timeout` passes
    ///
    /// Returns the time left on success.
    pub fn wait_event_timeout<F>(&self, cond: F, timeout: Duration) -> Result<Duration>
    where
        F: FnMut(&mut S) -> bool,
    {
        self.wait_common(false, Some(timeout), cond)
    }

    /// Block until `cond` holds or a signal arrives
    pub fn wait_event_interruptible<F>(&self, cond: F) -> Result<()>
    where
        F: FnMut(&mut S) -> bool,
    {
        self.wait_common(true, None, cond).map(|_| ())
    }

    /// Block until `cond` holds, a signal arrives or `timeout` passes
    pub fn wait_event_interruptible_timeout<F>(&self, cond: F, timeout: Duration) -> Result<Duration>
    where
        F: FnMut(&mut S) -> bool,
    {
        self.wait_common(true, Some(timeout), cond)
    }

    /// Register, check, sleep, repeat
    ///
    /// `cond` runs with the queue locked and may consume the state it
    /// waited for. Returns the time left (`Duration::MAX` without timeout).
    pub(crate) fn wait_common<F>(&self, interruptible: bool, timeout: Option<Duration>, mut cond: F) -> Result<Duration>
    where
        F: FnMut(&mut S) -> bool,
    {
        let deadline = timeout.map(|t| sched::ktime_get().saturating_add(t));
        let task = sched::current();
        let entry = Arc::new(WaitQueueEntry::new(task.clone()));

        loop {
            let mut inner = self.inner.lock();
            if cond(&mut inner.state) {
                inner.remove(&entry);
                return Ok(match deadline {
                    Some(deadline) => deadline.saturating_sub(sched::ktime_get()),
                    None => Duration::MAX,
                });
            }
            if interruptible && task.signal_pending() {
                inner.remove(&entry);
                return Err(Error::Interrupted);
            }
            let left = match deadline {
                Some(deadline) => {
                    let now = sched::ktime_get();
                    if now >= deadline {
                        inner.remove(&entry);
                        return Err(Error::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if !entry.is_linked() {
                inner.add(&entry);
            }
            drop(inner);

            task.sleep(left);
        }
    }
}

impl<S: Default> Default for WaitQueue<S> {
    fn default() -> Self {
        Self::with_state(S::default())
    }
}

impl<S> fmt::Debug for WaitQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue").field("waiters", &self.len()).finish()
    }
}

/// ============================================================================
/// Guard
/// ============================================================================

/// Locked wait queue
///
/// Dereferences to the queue state; wakes issued through the guard happen
/// under the same lock as the state update.
pub struct WaitQueueGuard<'a, S> {
    inner: MutexGuard<'a, Inner<S>>,
}

impl<S> WaitQueueGuard<'_, S> {
    /// Wake up to `nr` entries
    pub fn wake(&mut self, nr: usize) -> usize {
        self.inner.wake(nr)
    }

    /// Wake every entry
    pub fn wake_all(&mut self) -> usize {
        self.inner.wake(usize::MAX)
    }

    /// Whether any entry is registered
    pub fn is_active(&self) -> bool {
        !self.inner.waiters.is_empty()
    }
}

impl<S> Deref for WaitQueueGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.inner.state
    }
}

impl<S> DerefMut for WaitQueueGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.inner.state
    }
}
