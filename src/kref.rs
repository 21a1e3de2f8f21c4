// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reference Counting
//!
//! This module provides the saturating reference counter ([`Kref`]) that
//! every shared object in this crate embeds, and [`Ref`], an intrusive
//! shared pointer whose `Drop` is the only path that releases the object.
//!
//! # Design
//!
//! - **Saturating**: Overflow and underflow pin the counter at
//!   [`REFCOUNT_SATURATED`] instead of wrapping, so a leaked object is never
//!   freed twice. Both are programming errors and trip a debug assertion.
//! - **Single release**: Exactly one `put` observes the 1 -> 0 transition.
//! - **Intrusive**: A [`Ref`] can be rebuilt from a plain `&T`, which is how
//!   fence callbacks take a keepalive on the fence that invoked them.
//!
//! # Usage
//!
//! ```ignore
//! let kref = Kref::new();
//! kref.get();
//! assert!(!kref.put(|| unreachable!()));
//! assert!(kref.put(|| free_object()));
//! ```

use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicI32, Ordering};

/// ============================================================================
/// Kref
/// ============================================================================

/// Value a misused counter is pinned at
///
/// Halfway into the negative range so that further increments or
/// decrements cannot bring it back to zero.
pub const REFCOUNT_SATURATED: i32 = i32::MIN / 2;

/// Atomic saturating reference counter
pub struct Kref {
    refcount: AtomicI32,
}

impl Kref {
    /// Create a counter holding one reference
    pub const fn new() -> Self {
        Self::with_count(1)
    }

    /// Create a counter holding `count` references
    pub const fn with_count(count: i32) -> Self {
        Self {
            refcount: AtomicI32::new(count),
        }
    }

    /// Reset the counter to `count`
    ///
    /// Only valid while no other holder can observe the object.
    pub fn init(&self, count: i32) {
        self.refcount.store(count, Ordering::Relaxed);
    }

    /// Current count (racy; for diagnostics only)
    pub fn read(&self) -> i32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Take an additional reference
    ///
    /// The caller must already hold one.
    pub fn get(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        if old == 0 {
            self.saturate("increment on zero; use-after-free");
        } else if old < 0 || old == i32::MAX {
            self.saturate("increment overflow");
        }
    }

    /// Take a reference unless the count already dropped to zero
    ///
    /// Used to race safely against a concurrent final `put`.
    pub fn get_unless_zero(&self) -> bool {
        let mut old = self.refcount.load(Ordering::Relaxed);
        loop {
            if old == 0 {
                return false;
            }
            if old < 0 {
                // Saturated counters stay pinned and never release.
                return true;
            }
            let new = match old.checked_add(1) {
                Some(new) => new,
                None => {
                    self.saturate("increment overflow");
                    return true;
                }
            };
            match self.refcount.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }

    /// Drop a reference, calling `release` if it was the last one
    ///
    /// Returns `true` if the object was released.
    pub fn put<F: FnOnce()>(&self, release: F) -> bool {
        if self.dec_and_test() {
            release();
            true
        } else {
            false
        }
    }

    /// Drop a reference and report whether it was the last one
    pub(crate) fn dec_and_test(&self) -> bool {
        let old = self.refcount.fetch_sub(1, Ordering::Release);
        if old == 1 {
            // Pairs with the release above on every other holder.
            fence(Ordering::Acquire);
            return true;
        }
        if old <= 0 {
            self.saturate("decrement hit zero; leaking memory");
        }
        false
    }

    fn saturate(&self, what: &str) {
        self.refcount.store(REFCOUNT_SATURATED, Ordering::Relaxed);
        log::error!("refcount_t: {}", what);
        debug_assert!(false, "refcount_t: {}", what);
    }
}

impl Default for Kref {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Kref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kref").field("refcount", &self.read()).finish()
    }
}

/// ============================================================================
/// Ref
/// ============================================================================

/// Objects whose lifetime is tracked by an embedded [`Kref`]
///
/// # Safety
///
/// Implementors must only ever be reachable through a [`Ref`] created by
/// [`Ref::new`]; constructing a `Ref` from a `&T` that lives anywhere else
/// would free memory the allocator never handed out.
pub unsafe trait RefCounted {
    /// The embedded counter
    fn kref(&self) -> &Kref;
}

/// Shared pointer to a [`RefCounted`] object
pub struct Ref<T: RefCounted> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

// SAFETY: Sharing a `Ref<T>` shares `&T`, and the last holder drops `T`
// on whatever thread it runs on.
unsafe impl<T: RefCounted + Send + Sync> Send for Ref<T> {}
unsafe impl<T: RefCounted + Send + Sync> Sync for Ref<T> {}

impl<T: RefCounted> Ref<T> {
    /// Move `value` to the heap with a count of one
    pub fn new(value: T) -> Self {
        value.kref().init(1);
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Take a new reference from a borrowed object
    pub fn new_from(obj: &T) -> Self {
        obj.kref().get();
        Self {
            ptr: NonNull::from(obj),
            _marker: PhantomData,
        }
    }

    /// Take a new reference unless the object is already being released
    pub fn get_unless_zero(obj: &T) -> Option<Self> {
        if obj.kref().get_unless_zero() {
            Some(Self {
                ptr: NonNull::from(obj),
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Whether two pointers refer to the same object
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        core::ptr::eq(a.ptr.as_ptr(), b.ptr.as_ptr())
    }

    /// Current reference count (racy)
    pub fn count(this: &Self) -> i32 {
        this.kref().read()
    }

    /// Raw address, stable for the object's lifetime
    pub fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }
}

impl<T: RefCounted> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold a reference, so the object is alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: RefCounted> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self::new_from(self)
    }
}

impl<T: RefCounted> Drop for Ref<T> {
    fn drop(&mut self) {
        let last = {
            // SAFETY: We still hold our reference here.
            let obj = unsafe { self.ptr.as_ref() };
            obj.kref().dec_and_test()
        };
        if last {
            // SAFETY: The allocation came from `Ref::new` and no other holder remains.
            drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        }
    }
}

impl<T: RefCounted + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    struct Tracked {
        kref: Kref,
        drops: Arc<AtomicUsize>,
    }

    unsafe impl RefCounted for Tracked {
        fn kref(&self) -> &Kref {
            &self.kref
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked() -> (Ref<Tracked>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let obj = Ref::new(Tracked {
            kref: Kref::new(),
            drops: drops.clone(),
        });
        (obj, drops)
    }

    #[test]
    fn test_kref_put_releases_once() {
        let kref = Kref::new();
        kref.get();
        let mut released = 0;
        assert!(!kref.put(|| released += 1));
        assert!(kref.put(|| released += 1));
        assert_eq!(released, 1);
        assert_eq!(kref.read(), 0);
    }

    #[test]
    fn test_kref_get_unless_zero() {
        let kref = Kref::with_count(0);
        assert!(!kref.get_unless_zero());
        kref.init(1);
        assert!(kref.get_unless_zero());
        assert_eq!(kref.read(), 2);
    }

    #[test]
    #[should_panic(expected = "refcount_t")]
    fn test_kref_underflow_is_caught() {
        let kref = Kref::new();
        kref.put(|| {});
        kref.put(|| {});
    }

    #[test]
    #[should_panic(expected = "refcount_t")]
    fn test_kref_get_on_zero_is_caught() {
        let kref = Kref::with_count(0);
        kref.get();
    }

    #[test]
    fn test_kref_concurrent_get_put() {
        let kref = Arc::new(Kref::new());
        let released = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let kref = kref.clone();
                let released = released.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        kref.get();
                        kref.put(|| {
                            released.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(kref.put(|| {
            released.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ref_drop_releases_after_last_holder() {
        let (obj, drops) = tracked();
        let clones: Vec<_> = (0..4).map(|_| obj.clone()).collect();
        assert_eq!(Ref::count(&obj), 5);

        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clones);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ref_concurrent_clone_drop() {
        let (obj, drops) = tracked();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let obj = obj.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let extra = Ref::new_from(&*obj);
                        drop(extra);
                    }
                })
            })
            .collect();
        drop(obj);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ref_ptr_eq() {
        let (a, _) = tracked();
        let (b, _) = tracked();
        let a2 = Ref::new_from(&*a);
        assert!(Ref::ptr_eq(&a, &a2));
        assert!(!Ref::ptr_eq(&a, &b));
        assert!(Ref::get_unless_zero(&*b).is_some());
    }
}
