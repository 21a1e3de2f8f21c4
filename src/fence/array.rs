// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Fence Arrays
//!
//! An aggregate fence that signals once all of its children signaled, or
//! once any one of them did.
//!
//! The aggregate is signaled from a deferred call, never from inside
//! a child's callback, so signaling a child can never recurse into the
//! aggregate's own callbacks.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use super::{Fence, FenceFlags, FenceOps, FenceRef};
use crate::error::{Error, Result};
use crate::kref::Ref;
use crate::workqueue;

/// Operations of an aggregate fence
pub struct FenceArray {
    fences: Vec<FenceRef>,
    num_pending: AtomicI32,
    pending_error: AtomicI32,
    signal_on_any: bool,
}

impl FenceArray {
    /// Create an aggregate over `fences`
    ///
    /// With `signal_on_any` the aggregate signals after the first child,
    /// otherwise after the last. Fails with `InvalidArgument` if `fences`
    /// is empty.
    pub fn create(fences: Vec<FenceRef>, context: u64, seqno: u64, signal_on_any: bool) -> Result<FenceRef> {
        if fences.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let pending = if signal_on_any { 1 } else { fences.len() };
        let array = Self {
            num_pending: AtomicI32::new(i32::try_from(pending).map_err(|_| Error::InvalidArgument)?),
            pending_error: AtomicI32::new(0),
            fences,
            signal_on_any,
        };
        Ok(Fence::new(array, context, seqno))
    }

    /// The array behind `fence`, if it is one
    pub fn from_fence(fence: &Fence) -> Option<&FenceArray> {
        fence.ops_as::<FenceArray>()
    }

    /// Child fences
    pub fn fences(&self) -> &[FenceRef] {
        &self.fences
    }

    /// Number of children
    pub fn num_fences(&self) -> usize {
        self.fences.len()
    }

    /// Whether the aggregate signals on the first child
    pub fn signal_on_any(&self) -> bool {
        self.signal_on_any
    }

    /// Whether every child belongs to `context`
    pub fn matches_context(&self, context: u64) -> bool {
        self.fences.iter().all(|f| f.context() == context)
    }

    /// First child of an array, or `head` itself if it is not an array
    pub fn first(head: &FenceRef) -> Option<FenceRef> {
        match Self::from_fence(head) {
            Some(array) => array.fences.first().cloned(),
            None => Some(head.clone()),
        }
    }

    fn record_error(&self, error: i32) {
        if error != 0 {
            let _ = self.pending_error.compare_exchange(0, error, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    fn flush_error(&self, base: &Fence) {
        let error = self.pending_error.load(Ordering::Acquire);
        if error != 0 {
            base.set_error(error);
        }
    }

    /// Drop one pending count; true when it was the last
    fn dec_pending(&self) -> bool {
        self.num_pending.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// A child signaled; `base` is the keepalive the callback carried
fn child_signaled(base: FenceRef, child: &Fence) {
    let last = match FenceArray::from_fence(&base) {
        Some(array) => {
            array.record_error(child.error());
            array.dec_pending()
        }
        None => false,
    };
    if last {
        workqueue::defer(move || {
            if let Some(array) = FenceArray::from_fence(&base) {
                array.flush_error(&base);
            }
            let _ = base.signal();
        });
    }
}

impl FenceOps for FenceArray {
    fn driver_name(&self, _fence: &Fence) -> &str {
        "dma_fence_array"
    }

    fn timeline_name(&self, _fence: &Fence) -> &str {
        "unbound"
    }

    fn enable_signaling(&self, base: &Fence) -> bool {
        for child in &self.fences {
            let keepalive = Ref::new_from(base);
            if child.add_callback(move |c| child_signaled(keepalive, c)).is_err() {
                // Already signaled; the closure and its keepalive are gone.
                self.record_error(child.error());
                if self.dec_pending() {
                    self.flush_error(base);
                    return false;
                }
            }
        }
        true
    }

    fn signaled(&self, base: &Fence) -> bool {
        let mut pending = self.num_pending.load(Ordering::Acquire);
        if base.test_flag(FenceFlags::ENABLE_SIGNAL) {
            if pending <= 0 {
                self.flush_error(base);
                return true;
            }
            return false;
        }

        for child in &self.fences {
            if child.is_signaled() {
                self.record_error(child.error());
                pending -= 1;
                if pending == 0 {
                    self.flush_error(base);
                    return true;
                }
            }
        }
        false
    }

    fn release(&self, base: &Fence) {
        log::trace!(
            "fence array {}:{} released ({} children)",
            base.context(),
            base.seqno(),
            self.fences.len()
        );
    }
}

impl fmt::Debug for FenceArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceArray")
            .field("num_fences", &self.fences.len())
            .field("num_pending", &self.num_pending.load(Ordering::Relaxed))
            .field("signal_on_any", &self.signal_on_any)
            .finish()
    }
}
