// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Fence Chains
//!
//! A chain node wraps one fence and points at the previous node. A node is
//! done only when its own fence and every fence before it are done, which
//! makes a chain a timeline of points that may complete out of order.
//!
//! # Design
//!
//! - **Context reuse**: A node whose seqno is later than its predecessor's
//!   joins the predecessor's context; otherwise it starts a new one
//! - **Garbage collection**: [`FenceChain::walk`] unlinks predecessors whose
//!   fences already signaled
//! - **Flat drop**: Releasing a long chain unlinks nodes iteratively instead
//!   of recursing once per node

use core::fmt;
use spin::Mutex;

use super::{seqno_is_later, Fence, FenceOps, FenceRef};
use crate::error::{Error, Result};
use crate::kref::Ref;
use crate::workqueue;

/// Operations of a chain node
pub struct FenceChain {
    prev: Mutex<Option<FenceRef>>,
    prev_seqno: u64,
    fence: FenceRef,
}

impl FenceChain {
    /// Append `fence` at `seqno` after `prev`
    pub fn create(prev: Option<FenceRef>, fence: FenceRef, seqno: u64) -> FenceRef {
        let (context, seqno, prev_seqno) = match prev.as_ref() {
            Some(p) if Self::from_fence(p).is_some() && seqno_is_later(seqno, p.seqno(), p.ops().use_64bit_seqno()) => {
                (p.context(), seqno, p.seqno())
            }
            Some(p) if Self::from_fence(p).is_some() => (Fence::context_alloc(1), seqno.max(p.seqno()), 0),
            _ => (Fence::context_alloc(1), seqno, 0),
        };

        let node = Self {
            prev: Mutex::new(prev),
            prev_seqno,
            fence,
        };
        Fence::new(node, context, seqno)
    }

    /// The chain node behind `fence`, if it is one
    pub fn from_fence(fence: &Fence) -> Option<&FenceChain> {
        fence.ops_as::<FenceChain>()
    }

    /// The fence this node wraps
    pub fn fence(&self) -> &FenceRef {
        &self.fence
    }

    /// Seqno of the predecessor when this node joined its context
    pub fn prev_seqno(&self) -> u64 {
        self.prev_seqno
    }

    /// Current predecessor
    pub fn prev(&self) -> Option<FenceRef> {
        self.prev.lock().clone()
    }

    /// The fence wrapped by a chain node, or `fence` itself
    pub fn contained(fence: &FenceRef) -> FenceRef {
        match Self::from_fence(fence) {
            Some(chain) => chain.fence.clone(),
            None => fence.clone(),
        }
    }

    /// Step to the next unsignaled predecessor
    ///
    /// Signaled predecessors of `fence` are unlinked on the way. Returns
    /// `None` at the start of the chain or if `fence` is not a chain node.
    pub fn walk(fence: &FenceRef) -> Option<FenceRef> {
        let chain = Self::from_fence(fence)?;
        loop {
            let prev = chain.prev()?;
            let replacement = match Self::from_fence(&prev) {
                Some(prev_chain) => {
                    if !prev_chain.fence.is_signaled() {
                        return Some(prev);
                    }
                    prev_chain.prev()
                }
                None => {
                    if !prev.is_signaled() {
                        return Some(prev);
                    }
                    None
                }
            };

            let mut slot = chain.prev.lock();
            let unlinked = if slot.as_ref().is_some_and(|cur| Ref::ptr_eq(cur, &prev)) {
                core::mem::replace(&mut *slot, replacement)
            } else {
                None
            };
            drop(slot);
            drop(unlinked);
        }
    }

    /// Iterate `head` and its unsignaled predecessors
    pub fn iter(head: &FenceRef) -> ChainIter {
        ChainIter {
            next: Some(head.clone()),
        }
    }

    /// Find the node that contains `seqno`
    ///
    /// Returns `Ok(None)` if that point already signaled and was collected,
    /// and `InvalidArgument` if `head` is not a chain node or `seqno` lies
    /// past it. Seqno 0 always resolves to `head`.
    pub fn find_seqno(head: &FenceRef, seqno: u64) -> Result<Option<FenceRef>> {
        if seqno == 0 {
            return Ok(Some(head.clone()));
        }
        if Self::from_fence(head).is_none() || head.seqno() < seqno {
            return Err(Error::InvalidArgument);
        }
        for node in Self::iter(head) {
            let covered = node.context() != head.context()
                || Self::from_fence(&node).map_or(true, |c| c.prev_seqno < seqno);
            if covered {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Register a callback on the first unsignaled fence of the chain
    ///
    /// Returns `false` when every fence already signaled.
    fn arm(head: &FenceRef) -> bool {
        for node in Self::iter(head) {
            let contained = Self::contained(&node);
            let keepalive = head.clone();
            if contained.add_callback(move |_| rearm_later(keepalive)).is_ok() {
                return true;
            }
        }
        false
    }
}

/// A contained fence signaled; look for the next one from process context
fn rearm_later(head: FenceRef) {
    workqueue::defer(move || {
        if !FenceChain::arm(&head) {
            let _ = head.signal();
        }
    });
}

impl FenceOps for FenceChain {
    fn driver_name(&self, _fence: &Fence) -> &str {
        "dma_fence_chain"
    }

    fn timeline_name(&self, _fence: &Fence) -> &str {
        "unbound"
    }

    fn enable_signaling(&self, base: &Fence) -> bool {
        FenceChain::arm(&base.get())
    }

    fn signaled(&self, base: &Fence) -> bool {
        FenceChain::iter(&base.get()).all(|node| FenceChain::contained(&node).is_signaled())
    }

    fn use_64bit_seqno(&self) -> bool {
        true
    }
}

impl Drop for FenceChain {
    fn drop(&mut self) {
        let mut prev = self.prev.get_mut().take();
        while let Some(node) = prev.take() {
            // Someone else still holds the rest of the chain.
            if Ref::count(&node) > 1 {
                break;
            }
            prev = FenceChain::from_fence(&node).and_then(|chain| chain.prev.lock().take());
        }
    }
}

impl fmt::Debug for FenceChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceChain")
            .field("fence", &self.fence)
            .field("prev_seqno", &self.prev_seqno)
            .finish()
    }
}

/// Iterator over a chain, see [`FenceChain::iter`]
pub struct ChainIter {
    next: Option<FenceRef>,
}

impl Iterator for ChainIter {
    type Item = FenceRef;

    fn next(&mut self) -> Option<FenceRef> {
        let cur = self.next.take()?;
        self.next = FenceChain::walk(&cur);
        Some(cur)
    }
}
