// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! DMA Fences
//!
//! A fence represents "this unit of asynchronous work is done". Producers
//! (usually a driver's completion path) signal it exactly once; consumers
//! wait on it or register callbacks that run when it signals.
//!
//! # Design
//!
//! - **Monotonic flags**: `SIGNALED`, `TIMESTAMP` and `ENABLE_SIGNAL` are only
//!   ever set, so the signaled bit can be tested without the lock
//! - **Detach then invoke**: `signal` moves the callback list out under the
//!   fence lock and runs the callbacks after unlocking, so a callback may
//!   re-enter fence machinery
//! - **Ordering**: Sequence numbers are comparable only within one context,
//!   with 32-bit wraparound unless the ops ask for 64-bit compares
//! - **Lifetime**: Fences live in a [`Ref`]; dropping an unsignaled fence
//!   that still has callbacks signals it with `-EDEADLK` first
//!
//! # Usage
//!
//! ```ignore
//! let ctx = Fence::context_alloc(1);
//! let fence = Fence::new(MyRingOps, ctx, 1);
//!
//! fence.add_callback(|f| log::info!("fence {} done", f.seqno()))?;
//! fence.signal()?;
//! fence.wait(false)?;
//! ```

pub mod array;
pub mod chain;
mod wait;

pub use array::FenceArray;
pub use chain::FenceChain;
pub use wait::default_wait;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard, Once};

use crate::error::{errno, Error, Result};
use crate::kref::{Kref, Ref, RefCounted};
use crate::sched;

/// Shared pointer to a fence
pub type FenceRef = Ref<Fence>;

/// ============================================================================
/// Flags
/// ============================================================================

bitflags! {
    /// Fence state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FenceFlags: u32 {
        /// Fence has signaled (terminal)
        const SIGNALED = 1 << 0;
        /// A signal timestamp was recorded
        const TIMESTAMP = 1 << 1;
        /// `enable_signaling` was requested
        const ENABLE_SIGNAL = 1 << 2;
        /// First bit available to fence implementations
        const USER = 1 << 3;

        const _ = !0;
    }
}

/// ============================================================================
/// Fence Operations
/// ============================================================================

/// Driver-supplied fence behavior
///
/// Every method receives the fence it is attached to.
pub trait FenceOps: Any + Send + Sync {
    /// Name of the driver that created the fence
    fn driver_name(&self, fence: &Fence) -> &str;

    /// Name of the fence's timeline
    fn timeline_name(&self, fence: &Fence) -> &str;

    /// Arrange for `signal` to be called eventually
    ///
    /// Called at most once, without the fence lock held. Returning `false`
    /// means the fence is already done; it is then signaled immediately.
    fn enable_signaling(&self, _fence: &Fence) -> bool {
        true
    }

    /// Poll the hardware; `true` signals the fence as a side effect
    fn signaled(&self, _fence: &Fence) -> bool {
        false
    }

    /// Custom wait implementation
    fn wait(&self, fence: &Fence, intr: bool, timeout: Option<Duration>) -> Result<Duration> {
        default_wait(fence, intr, timeout)
    }

    /// Called when the last reference is dropped
    fn release(&self, _fence: &Fence) {}

    /// Compare sequence numbers as full 64-bit values
    fn use_64bit_seqno(&self) -> bool {
        false
    }

    /// Hint that the fence should signal by `deadline`
    fn set_deadline(&self, _fence: &Fence, _deadline: Duration) {}
}

/// ============================================================================
/// Callbacks
/// ============================================================================

/// Handle returned by [`Fence::add_callback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

static NEXT_CALLBACK: AtomicU64 = AtomicU64::new(1);

type CallbackFn = Box<dyn FnOnce(&Fence) + Send>;

struct Callback {
    id: u64,
    func: CallbackFn,
}

struct FenceInner {
    callbacks: Vec<Callback>,
    timestamp: Duration,
}

/// ============================================================================
/// Global State
/// ============================================================================

/// Context 0 belongs to stub fences
static FENCE_CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

static STUB: Once<FenceRef> = Once::new();

struct StubOps;

impl FenceOps for StubOps {
    fn driver_name(&self, _fence: &Fence) -> &str {
        "stub"
    }

    fn timeline_name(&self, _fence: &Fence) -> &str {
        "stub"
    }
}

/// ============================================================================
/// Fence
/// ============================================================================

/// Single-shot cross-domain synchronization object
pub struct Fence {
    kref: Kref,
    ops: Box<dyn FenceOps>,
    context: u64,
    seqno: u64,
    flags: AtomicU32,
    error: AtomicI32,
    inner: Mutex<FenceInner>,
}

// SAFETY: Fences are only ever created through `Ref::new` in `Fence::new`.
unsafe impl RefCounted for Fence {
    fn kref(&self) -> &Kref {
        &self.kref
    }
}

impl Fence {
    /// Create an unsignaled fence
    pub fn new<O: FenceOps>(ops: O, context: u64, seqno: u64) -> FenceRef {
        Ref::new(Self {
            kref: Kref::new(),
            ops: Box::new(ops),
            context,
            seqno,
            flags: AtomicU32::new(0),
            error: AtomicI32::new(0),
            inner: Mutex::new(FenceInner {
                callbacks: Vec::new(),
                timestamp: Duration::ZERO,
            }),
        })
    }

    /// Allocate `num` consecutive fence contexts; returns the first
    pub fn context_alloc(num: u32) -> u64 {
        debug_assert!(num > 0);
        FENCE_CONTEXT_COUNTER.fetch_add(u64::from(num), Ordering::Relaxed)
    }

    /// The shared, always-signaled stub fence
    pub fn stub() -> FenceRef {
        STUB.call_once(|| {
            let stub = Fence::new(StubOps, 0, 0);
            stub.set_flag(FenceFlags::ENABLE_SIGNAL);
            let _ = stub.signal();
            stub
        })
        .clone()
    }

    /// A new signaled stub fence with the given timestamp
    pub fn allocate_private_stub(timestamp: Duration) -> FenceRef {
        let stub = Fence::new(StubOps, 0, 0);
        stub.set_flag(FenceFlags::ENABLE_SIGNAL);
        let _ = stub.signal_timestamp(timestamp);
        stub
    }

    /// Take another reference
    pub fn get(&self) -> FenceRef {
        Ref::new_from(self)
    }

    /// Fence context
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Sequence number within the context
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Driver operations
    pub fn ops(&self) -> &dyn FenceOps {
        self.ops.as_ref()
    }

    /// Downcast the operations to a concrete type
    pub fn ops_as<T: FenceOps>(&self) -> Option<&T> {
        let ops: &dyn Any = self.ops.as_ref();
        ops.downcast_ref::<T>()
    }

    /// Driver name from the ops
    pub fn driver_name(&self) -> &str {
        self.ops.driver_name(self)
    }

    /// Timeline name from the ops
    pub fn timeline_name(&self) -> &str {
        self.ops.timeline_name(self)
    }

    /// Current flags
    pub fn flags(&self) -> FenceFlags {
        FenceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Test a flag
    pub fn test_flag(&self, flag: FenceFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set a flag, returning whether it was already set
    ///
    /// Only `USER` bits and above should be set by implementations.
    pub fn set_flag(&self, flag: FenceFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        FenceFlags::from_bits_retain(old).contains(flag)
    }

    /// Lock the fence
    pub fn lock(&self) -> FenceGuard<'_> {
        FenceGuard {
            fence: self,
            inner: Some(self.inner.lock()),
            detached: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    /// Signal the fence now
    ///
    /// Returns `AlreadyDone` if it had already signaled; callbacks then do
    /// not run again.
    pub fn signal(&self) -> Result<()> {
        self.signal_timestamp(sched::ktime_get())
    }

    /// Signal the fence with an explicit timestamp
    pub fn signal_timestamp(&self, timestamp: Duration) -> Result<()> {
        let mut guard = self.lock();
        guard.signal_timestamp_locked(timestamp)
    }

    /// Whether the fence has signaled
    ///
    /// Polls the driver if the signaled bit is not yet set.
    pub fn is_signaled(&self) -> bool {
        if self.test_flag(FenceFlags::SIGNALED) {
            return true;
        }
        if self.ops.signaled(self) {
            let _ = self.signal();
            return true;
        }
        false
    }

    /// Ask the producer to signal, without registering a callback
    pub fn enable_sw_signaling(&self) {
        self.enable_signaling();
    }

    /// Run `ops.enable_signaling` once; returns whether still unsignaled
    fn enable_signaling(&self) -> bool {
        let was_enabled = self.set_flag(FenceFlags::ENABLE_SIGNAL);
        if !was_enabled && !self.test_flag(FenceFlags::SIGNALED) {
            log::trace!("fence {}:{} enable signaling", self.context, self.seqno);
            if !self.ops.enable_signaling(self) {
                let _ = self.signal();
            }
        }
        !self.test_flag(FenceFlags::SIGNALED)
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    /// Run `func` once the fence signals
    ///
    /// Fails with `AlreadyDone` if the fence has signaled; `func` is then
    /// dropped without being called. Callbacks run in registration order.
    ///
    /// A fence released while callbacks are pending runs them from its
    /// destructor with `-EDEADLK`. The `&Fence` they get then has no
    /// references left, so `func` must not call [`Fence::get`] on it; a
    /// callback that needs the fence afterwards captures its own [`FenceRef`].
    pub fn add_callback<F>(&self, func: F) -> Result<CallbackHandle>
    where
        F: FnOnce(&Fence) + Send + 'static,
    {
        if self.test_flag(FenceFlags::SIGNALED) || !self.enable_signaling() {
            return Err(Error::AlreadyDone);
        }

        let mut inner = self.inner.lock();
        // Re-check: a signal may have detached the list since.
        if self.test_flag(FenceFlags::SIGNALED) {
            return Err(Error::AlreadyDone);
        }
        let id = NEXT_CALLBACK.fetch_add(1, Ordering::Relaxed);
        inner.callbacks.push(Callback {
            id,
            func: Box::new(func),
        });
        Ok(CallbackHandle(id))
    }

    /// Unregister a callback
    ///
    /// Returns `false` if it already ran (or is running) or was never added.
    pub fn remove_callback(&self, handle: CallbackHandle) -> bool {
        let mut inner = self.inner.lock();
        match inner.callbacks.iter().position(|cb| cb.id == handle.0) {
            Some(pos) => {
                inner.callbacks.remove(pos);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Error and status
    // ------------------------------------------------------------------------

    /// Record a failure (negative errno) before signaling
    ///
    /// The first error sticks; errors set after signaling are ignored.
    pub fn set_error(&self, error: i32) {
        debug_assert!(error < 0, "fence error must be a negative errno");
        if self.test_flag(FenceFlags::SIGNALED) {
            log::warn!(
                "fence {}:{}: set_error({}) after signal ignored",
                self.context,
                self.seqno,
                error
            );
            return;
        }
        let _ = self.error.compare_exchange(0, error, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Recorded error, 0 on success
    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    /// 0 while pending, 1 when signaled successfully, the error otherwise
    pub fn get_status(&self) -> i32 {
        if !self.is_signaled() {
            return 0;
        }
        match self.error() {
            0 => 1,
            err => err,
        }
    }

    /// `Ok(false)` while pending, `Ok(true)` when done, `Err` when done with
    /// an error
    pub fn status(&self) -> Result<bool> {
        match self.get_status() {
            0 => Ok(false),
            1 => Ok(true),
            err => Err(Error::Fence(err)),
        }
    }

    /// Signal timestamp, once recorded
    pub fn timestamp(&self) -> Option<Duration> {
        if self.test_flag(FenceFlags::TIMESTAMP) {
            Some(self.inner.lock().timestamp)
        } else {
            None
        }
    }

    /// Pass a deadline hint to the producer
    pub fn set_deadline(&self, deadline: Duration) {
        if !self.is_signaled() {
            self.ops.set_deadline(self, deadline);
        }
    }

    // ------------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------------

    /// Whether this fence comes after `other` on the same timeline
    ///
    /// Comparing fences from different contexts is a programming error.
    pub fn is_later(&self, other: &Fence) -> bool {
        debug_assert_eq!(self.context, other.context, "is_later across fence contexts");
        seqno_is_later(self.seqno, other.seqno, self.ops.use_64bit_seqno())
    }

    /// Whether `self` is later than or equal to `other`
    pub fn is_later_or_same(&self, other: &Fence) -> bool {
        core::ptr::eq(self, other) || !other.is_later(self)
    }

    /// The later of two fences on one timeline
    ///
    /// Returns `None` (and warns) if they are on different contexts.
    pub fn later<'a>(a: &'a FenceRef, b: &'a FenceRef) -> Option<&'a FenceRef> {
        if a.context != b.context {
            log::warn!("fence: later() across contexts {} and {}", a.context, b.context);
            return None;
        }
        if a.is_later(b) {
            Some(a)
        } else {
            Some(b)
        }
    }
}

/// Compare two sequence numbers
///
/// In 32-bit mode the comparison is wraparound-aware, so 0 is later than
/// 0xFFFF_FFFF.
pub fn seqno_is_later(f1: u64, f2: u64, use_64bit: bool) -> bool {
    if use_64bit {
        f1 > f2
    } else {
        (f1 as u32).wrapping_sub(f2 as u32) as i32 > 0
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        let pending = !self.inner.get_mut().callbacks.is_empty();
        if pending && !self.test_flag(FenceFlags::SIGNALED) {
            log::error!(
                "fence {}:{}:{}:{} released with pending signals",
                self.ops.driver_name(self),
                self.ops.timeline_name(self),
                self.context,
                self.seqno
            );
            self.set_error(-errno::EDEADLK);
            let _ = self.signal();
        }
        self.ops.release(self);
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("flags", &self.flags())
            .field("error", &self.error())
            .finish()
    }
}

/// ============================================================================
/// Fence Guard
/// ============================================================================

/// Locked fence
///
/// Callbacks detached by `signal_locked` run when the guard is dropped,
/// after the lock is released.
pub struct FenceGuard<'a> {
    fence: &'a Fence,
    inner: Option<MutexGuard<'a, FenceInner>>,
    detached: Vec<Callback>,
}

impl FenceGuard<'_> {
    /// Signal while holding the lock
    pub fn signal_locked(&mut self) -> Result<()> {
        self.signal_timestamp_locked(sched::ktime_get())
    }

    /// Signal with a timestamp while holding the lock
    pub fn signal_timestamp_locked(&mut self, timestamp: Duration) -> Result<()> {
        let fence = self.fence;
        let Some(inner) = self.inner.as_mut() else {
            return Err(Error::Busy);
        };
        if fence.set_flag(FenceFlags::SIGNALED) {
            return Err(Error::AlreadyDone);
        }
        inner.timestamp = timestamp;
        fence.set_flag(FenceFlags::TIMESTAMP);

        let callbacks = mem::take(&mut inner.callbacks);
        self.detached.extend(callbacks);
        log::trace!(
            "fence {}:{} signaled ({} callbacks, error {})",
            fence.context,
            fence.seqno,
            self.detached.len(),
            fence.error()
        );
        Ok(())
    }

    /// Signaled bit
    pub fn is_signaled(&self) -> bool {
        self.fence.test_flag(FenceFlags::SIGNALED)
    }

    /// Number of registered callbacks
    pub fn pending_callbacks(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.callbacks.len())
    }
}

impl core::ops::Deref for FenceGuard<'_> {
    type Target = Fence;

    fn deref(&self) -> &Fence {
        self.fence
    }
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        drop(self.inner.take());
        for cb in self.detached.drain(..) {
            (cb.func)(self.fence);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;
    use test_case::test_case;

    /// Software-only fence ops for tests
    pub(crate) struct TestOps {
        pub(crate) enable_calls: AtomicUsize,
        pub(crate) enable_result: bool,
        pub(crate) wide: bool,
    }

    impl TestOps {
        pub(crate) fn new() -> Self {
            Self {
                enable_calls: AtomicUsize::new(0),
                enable_result: true,
                wide: false,
            }
        }
    }

    impl FenceOps for TestOps {
        fn driver_name(&self, _fence: &Fence) -> &str {
            "test"
        }

        fn timeline_name(&self, _fence: &Fence) -> &str {
            "test-ring"
        }

        fn enable_signaling(&self, _fence: &Fence) -> bool {
            self.enable_calls.fetch_add(1, Ordering::SeqCst);
            self.enable_result
        }

        fn use_64bit_seqno(&self) -> bool {
            self.wide
        }
    }

    pub(crate) fn test_fence(context: u64, seqno: u64) -> FenceRef {
        Fence::new(TestOps::new(), context, seqno)
    }

    #[test]
    fn test_signal_runs_callbacks_in_order_once() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            fence.add_callback(move |_| order.lock().push(i)).unwrap();
        }

        assert_eq!(fence.signal(), Ok(()));
        assert_eq!(fence.signal(), Err(Error::AlreadyDone));
        assert!(fence.is_signaled());
        assert_eq!(*order.lock(), [0, 1, 2, 3]);
        assert!(fence.timestamp().is_some());
    }

    #[test]
    fn test_add_callback_after_signal_fails() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        fence.signal().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        assert_eq!(
            fence.add_callback(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            Err(Error::AlreadyDone)
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enable_signaling_called_once() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        fence.add_callback(|_| {}).unwrap();
        fence.add_callback(|_| {}).unwrap();
        fence.enable_sw_signaling();
        let ops = fence.ops_as::<TestOps>().unwrap();
        assert_eq!(ops.enable_calls.load(Ordering::SeqCst), 1);
        assert!(fence.test_flag(FenceFlags::ENABLE_SIGNAL));
    }

    #[test]
    fn test_enable_signaling_failure_signals() {
        let mut ops = TestOps::new();
        ops.enable_result = false;
        let fence = Fence::new(ops, Fence::context_alloc(1), 1);
        assert_eq!(fence.add_callback(|_| {}), Err(Error::AlreadyDone));
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_remove_callback() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let cb = fence
            .add_callback(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(fence.remove_callback(cb));
        assert!(!fence.remove_callback(cb));
        fence.signal().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_reenter_fence() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        fence
            .add_callback(move |f| {
                // Would deadlock if callbacks ran under the fence lock.
                assert!(f.is_signaled());
                assert_eq!(f.add_callback(|_| {}), Err(Error::AlreadyDone));
                s.store(f.lock().pending_callbacks() + 1, Ordering::SeqCst);
            })
            .unwrap();
        fence.signal().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_locked_defers_callbacks() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        fence
            .add_callback(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let mut guard = fence.lock();
        guard.signal_locked().unwrap();
        assert!(guard.is_signaled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_is_sticky() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        assert_eq!(fence.get_status(), 0);
        fence.set_error(-errno::EIO);
        fence.set_error(-errno::ETIMEDOUT);
        fence.signal().unwrap();
        fence.set_error(-errno::EINVAL);
        assert_eq!(fence.error(), -errno::EIO);
        assert_eq!(fence.status(), Err(Error::Fence(-errno::EIO)));
    }

    #[test]
    fn test_status_success() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        assert_eq!(fence.status(), Ok(false));
        fence.signal().unwrap();
        assert_eq!(fence.status(), Ok(true));
        assert_eq!(fence.get_status(), 1);
    }

    #[test_case(9, 5, true ; "newer is later")]
    #[test_case(5, 9, false ; "older is not later")]
    #[test_case(5, 5, false ; "never later than itself")]
    #[test_case(0, 0xFFFF_FFFF, true ; "wraparound")]
    #[test_case(0xFFFF_FFFF, 0, false ; "wraparound reversed")]
    fn test_is_later_32bit(a: u64, b: u64, later: bool) {
        let ctx = Fence::context_alloc(1);
        let fa = test_fence(ctx, a);
        let fb = test_fence(ctx, b);
        assert_eq!(fa.is_later(&fb), later);
    }

    #[test]
    fn test_is_later_64bit() {
        assert!(!seqno_is_later(0, 0xFFFF_FFFF, true));
        assert!(seqno_is_later(0x1_0000_0000, 0xFFFF_FFFF, true));
        let mut ops = TestOps::new();
        ops.wide = true;
        let ctx = Fence::context_alloc(1);
        let a = Fence::new(ops, ctx, 0x1_0000_0001);
        let b = test_fence(ctx, 2);
        assert!(a.is_later(&b));
        assert!(a.is_later_or_same(&a));
    }

    #[test]
    fn test_later_picks_newest() {
        let ctx = Fence::context_alloc(1);
        let a = test_fence(ctx, 3);
        let b = test_fence(ctx, 7);
        assert!(Ref::ptr_eq(Fence::later(&a, &b).unwrap(), &b));
        let other = test_fence(Fence::context_alloc(1), 1);
        assert!(Fence::later(&a, &other).is_none());
    }

    #[test]
    fn test_context_alloc_is_unique() {
        let a = Fence::context_alloc(4);
        let b = Fence::context_alloc(1);
        assert!(a >= 1);
        assert!(b >= a + 4);
    }

    #[test]
    fn test_stub_is_signaled_singleton() {
        let a = Fence::stub();
        let b = Fence::stub();
        assert!(Ref::ptr_eq(&a, &b));
        assert!(a.is_signaled());
        assert_eq!(a.context(), 0);

        let ts = Duration::from_secs(3);
        let private = Fence::allocate_private_stub(ts);
        assert!(!Ref::ptr_eq(&a, &private));
        assert_eq!(private.timestamp(), Some(ts));
    }

    #[test]
    fn test_drop_with_pending_callbacks_signals_deadlock() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let err = Arc::new(AtomicI32::new(0));
        let e = err.clone();
        fence
            .add_callback(move |f| e.store(f.error(), Ordering::SeqCst))
            .unwrap();
        drop(fence);
        assert_eq!(err.load(Ordering::SeqCst), -errno::EDEADLK);
    }

    #[test]
    fn test_release_callback_reads_fence_in_place() {
        let fence = test_fence(Fence::context_alloc(1), 7);
        let seen = Arc::new(AtomicI32::new(0));
        let s = seen.clone();
        fence
            .add_callback(move |f| {
                // Plain reads only; no new reference is taken here.
                assert_eq!(f.seqno(), 7);
                s.store(f.get_status(), Ordering::SeqCst);
            })
            .unwrap();
        drop(fence);
        assert_eq!(seen.load(Ordering::SeqCst), -errno::EDEADLK);
    }

    #[test]
    fn test_concurrent_signal_runs_callbacks_once() {
        let fence = test_fence(Fence::context_alloc(1), 1);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let r = ran.clone();
            fence
                .add_callback(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let winners = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let fence = fence.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if fence.signal().is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
