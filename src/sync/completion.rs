// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Completion
//!
//! A counted wakeup: each `complete()` lets one waiter through, while
//! `complete_all()` opens the completion for every current and future
//! waiter until `reinit()`.
//!
//! # Usage
//!
//! ```ignore
//! let done = Completion::new();
//!
//! // Producer
//! done.complete();
//!
//! // Consumer
//! done.wait();
//! ```

use core::fmt;
use core::time::Duration;

use super::wait_queue::WaitQueue;
use crate::error::Result;

/// `done` value set by `complete_all`; never decremented
const COMPLETE_ALL: u32 = u32::MAX;

/// Counted one-shot/multi-shot event
pub struct Completion {
    wait: WaitQueue<u32>,
}

/// Take one unit if available
fn consume(done: &mut u32) -> bool {
    if *done == 0 {
        return false;
    }
    if *done != COMPLETE_ALL {
        *done -= 1;
    }
    true
}

impl Completion {
    /// Create a completion with nothing done
    pub const fn new() -> Self {
        Self {
            wait: WaitQueue::with_state(0),
        }
    }

    /// Reset to nothing done
    ///
    /// Only the owner may call this, between uses.
    pub fn reinit(&self) {
        *self.wait.lock() = 0;
    }

    /// Signal one waiter
    pub fn complete(&self) {
        let mut done = self.wait.lock();
        if *done != COMPLETE_ALL {
            *done += 1;
        }
        done.wake(1);
    }

    /// Signal every waiter, now and until `reinit`
    pub fn complete_all(&self) {
        let mut done = self.wait.lock();
        *done = COMPLETE_ALL;
        done.wake_all();
    }

    /// Block until completed
    pub fn wait(&self) {
        self.wait.wait_event(consume);
    }

    /// Block until completed or `timeout` passes
    ///
    /// Returns the time left, or `TimedOut`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Duration> {
        self.wait.wait_event_timeout(consume, timeout)
    }

    /// Block until completed or a signal arrives
    pub fn wait_interruptible(&self) -> Result<()> {
        self.wait.wait_event_interruptible(consume)
    }

    /// Block until completed, a signal arrives or `timeout` passes
    pub fn wait_interruptible_timeout(&self, timeout: Duration) -> Result<Duration> {
        self.wait.wait_event_interruptible_timeout(consume, timeout)
    }

    /// Consume a completion without blocking
    pub fn try_wait(&self) -> bool {
        consume(&mut self.wait.lock())
    }

    /// Whether a wait would succeed right now (does not consume)
    pub fn done(&self) -> bool {
        *self.wait.lock() != 0
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("done", &*self.wait.lock()).finish()
    }
}
