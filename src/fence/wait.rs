// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Waiting on fences
//!
//! Waits register a private callback that wakes a wait queue, then sleep on
//! that queue until the signaled bit is set. The callback is always removed
//! before returning.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use super::{Fence, FenceFlags, FenceRef};
use crate::error::{Error, Result};
use crate::sched;
use crate::sync::WaitQueue;

fn left(timeout: Option<Duration>) -> Duration {
    timeout.unwrap_or(Duration::MAX)
}

/// Wait implementation used by ops that do not provide their own
///
/// Returns the time left on success; a zero `timeout` only checks.
pub fn default_wait(fence: &Fence, intr: bool, timeout: Option<Duration>) -> Result<Duration> {
    if fence.test_flag(FenceFlags::SIGNALED) {
        return Ok(left(timeout));
    }
    if intr && sched::current().signal_pending() {
        return Err(Error::Interrupted);
    }
    if timeout == Some(Duration::ZERO) {
        return Err(Error::TimedOut);
    }

    let wq = Arc::new(WaitQueue::new());
    let waker = wq.clone();
    let cb = match fence.add_callback(move |_| {
        waker.wake_all();
    }) {
        Ok(cb) => cb,
        Err(Error::AlreadyDone) => return Ok(left(timeout)),
        Err(err) => return Err(err),
    };

    let ret = wq.wait_common(intr, timeout, |_| fence.test_flag(FenceFlags::SIGNALED));
    fence.remove_callback(cb);
    ret
}

impl Fence {
    /// Block until the fence signals
    ///
    /// Success only means the fence is done; check [`Fence::error`] for the
    /// outcome of the work.
    pub fn wait(&self, intr: bool) -> Result<()> {
        self.wait_inner(intr, None).map(|_| ())
    }

    /// Block until the fence signals or `timeout` passes
    ///
    /// Returns the time left. A zero timeout only checks the state.
    pub fn wait_timeout(&self, intr: bool, timeout: Duration) -> Result<Duration> {
        self.wait_inner(intr, Some(timeout))
    }

    fn wait_inner(&self, intr: bool, timeout: Option<Duration>) -> Result<Duration> {
        if timeout == Some(Duration::ZERO) {
            return if self.is_signaled() {
                Ok(Duration::ZERO)
            } else {
                Err(Error::TimedOut)
            };
        }
        self.enable_sw_signaling();
        self.ops.wait(self, intr, timeout)
    }

    /// Block until any fence in `fences` signals
    ///
    /// Returns the index of a signaled fence and the time left. Callbacks
    /// registered on the other fences are removed before returning.
    pub fn wait_any(fences: &[FenceRef], intr: bool, timeout: Option<Duration>) -> Result<(usize, Duration)> {
        if fences.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if let Some(idx) = fences.iter().position(|f| f.is_signaled()) {
            return Ok((idx, left(timeout)));
        }
        if timeout == Some(Duration::ZERO) {
            return Err(Error::TimedOut);
        }

        let wq = Arc::new(WaitQueue::new());
        let mut handles = Vec::with_capacity(fences.len());
        let mut ready = None;
        for (idx, fence) in fences.iter().enumerate() {
            let waker = wq.clone();
            match fence.add_callback(move |_| {
                waker.wake_all();
            }) {
                Ok(cb) => handles.push((idx, cb)),
                Err(_) => {
                    ready = Some(idx);
                    break;
                }
            }
        }

        let ret = match ready {
            Some(idx) => Ok((idx, left(timeout))),
            None => {
                let mut idx = 0;
                let waited = wq.wait_common(intr, timeout, |_| {
                    match fences.iter().position(|f| f.test_flag(FenceFlags::SIGNALED)) {
                        Some(found) => {
                            idx = found;
                            true
                        }
                        None => false,
                    }
                });
                waited.map(|remaining| (idx, remaining))
            }
        };

        for (idx, cb) in handles {
            fences[idx].remove_callback(cb);
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_fence;
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_on_signaled_returns_immediately() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        fence.signal().unwrap();
        assert_eq!(fence.wait(false), Ok(()));
        assert_eq!(fence.wait_timeout(false, Duration::ZERO), Ok(Duration::ZERO));
    }

    #[test]
    fn test_wait_timeout_expires_and_cleans_up() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        assert_eq!(fence.wait_timeout(false, Duration::ZERO), Err(Error::TimedOut));
        assert_eq!(
            fence.wait_timeout(false, Duration::from_millis(5)),
            Err(Error::TimedOut)
        );
        assert_eq!(fence.lock().pending_callbacks(), 0);
    }

    #[test]
    fn test_wait_woken_by_signal() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let producer = {
            let fence = fence.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(10));
                fence.set_error(-crate::error::errno::EIO);
                fence.signal().unwrap();
            })
        };
        // The wait succeeds even though the work failed.
        assert_eq!(fence.wait(false), Ok(()));
        assert_eq!(fence.error(), -crate::error::errno::EIO);
        producer.join().unwrap();
    }

    #[test]
    fn test_wait_interruptible() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let me = sched::current();
        me.send_signal();
        assert_eq!(fence.wait(true), Err(Error::Interrupted));
        me.flush_signals();
        assert_eq!(fence.lock().pending_callbacks(), 0);
    }

    #[test]
    fn test_wait_any_reports_index() {
        let ctx = Fence::context_alloc(1);
        let fences: Vec<_> = (1..=3).map(|s| test_fence(ctx, s)).collect();
        let second = fences[1].clone();
        let producer = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(10));
            second.signal().unwrap();
        });

        let (idx, _) = Fence::wait_any(&fences, false, None).unwrap();
        assert_eq!(idx, 1);
        producer.join().unwrap();
        for f in &fences {
            assert_eq!(f.lock().pending_callbacks(), 0);
        }
    }

    #[test]
    fn test_wait_any_edge_cases() {
        assert_eq!(Fence::wait_any(&[], false, None), Err(Error::InvalidArgument));
        let ctx = Fence::context_alloc(1);
        let fences = [test_fence(ctx, 1), test_fence(ctx, 2)];
        assert_eq!(
            Fence::wait_any(&fences, false, Some(Duration::from_millis(5))),
            Err(Error::TimedOut)
        );
        fences[1].signal().unwrap();
        assert_eq!(Fence::wait_any(&fences, false, Some(Duration::ZERO)).map(|r| r.0), Ok(1));
    }
}
