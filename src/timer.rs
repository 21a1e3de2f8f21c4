// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Timers
//!
//! One-shot timers whose callbacks run on a single service kthread
//! (`ktimerd`), started on first use. Delayed work is built on these.
//!
//! # Design
//!
//! - **Ordered**: Pending timers are kept sorted by deadline, ties broken by
//!   arming order
//! - **Re-armable**: Arming a pending timer moves its deadline
//! - **Synchronous cancel**: `cancel_sync` also waits for a callback that is
//!   already running
//!
//! # Usage
//!
//! ```ignore
//! let timer = Timer::new(|| log::info!("fired"));
//! timer.arm(Duration::from_millis(10));
//! timer.cancel_sync();
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use spin::Once;

use crate::sched::{self, kthread, Kthread};
use crate::sync::WaitQueue;

/// Timer identifier
pub type TimerId = u64;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// ============================================================================
/// Timer Service
/// ============================================================================

type TimerKey = (Duration, u64);

#[derive(Default)]
struct TimerQueue {
    pending: BTreeMap<TimerKey, Arc<TimerInner>>,
    armed: BTreeMap<TimerId, TimerKey>,
    running: Option<TimerId>,
    generation: u64,
    seq: u64,
}

impl TimerQueue {
    fn remove(&mut self, id: TimerId) -> bool {
        match self.armed.remove(&id) {
            Some(key) => {
                self.pending.remove(&key);
                true
            }
            None => false,
        }
    }
}

struct TimerService {
    queue: Arc<WaitQueue<TimerQueue>>,
    _thread: Option<Kthread>,
}

static SERVICE: Once<TimerService> = Once::new();

fn service() -> &'static TimerService {
    SERVICE.call_once(|| {
        let queue = Arc::new(WaitQueue::with_state(TimerQueue::default()));
        let thread_queue = queue.clone();
        let thread = match Kthread::run("ktimerd", move || timer_thread(&thread_queue)) {
            Ok(thread) => Some(thread),
            Err(err) => {
                log::error!("timer: failed to start ktimerd: {}", err);
                None
            }
        };
        TimerService { queue, _thread: thread }
    })
}

fn timer_thread(queue: &WaitQueue<TimerQueue>) -> i32 {
    while !kthread::should_stop() {
        let mut q = queue.lock();
        let now = sched::ktime_get();
        let next = q.pending.first_key_value().map(|(key, _)| *key);

        let timeout = match next {
            Some(key) if key.0 <= now => {
                if let Some(timer) = q.pending.remove(&key) {
                    q.armed.remove(&timer.id);
                    q.running = Some(timer.id);
                    drop(q);

                    (timer.func)();

                    let mut q = queue.lock();
                    q.running = None;
                    q.wake_all();
                }
                continue;
            }
            Some(key) => Some(key.0 - now),
            None => None,
        };

        let generation = q.generation;
        drop(q);
        let changed = |q: &mut TimerQueue| q.generation != generation || kthread::should_stop();
        match timeout {
            Some(timeout) => {
                // Timing out just means the head timer is due.
                let _ = queue.wait_event_timeout(changed, timeout);
            }
            None => queue.wait_event(changed),
        }
    }
    0
}

/// ============================================================================
/// Timer
/// ============================================================================

struct TimerInner {
    id: TimerId,
    func: Box<dyn Fn() + Send + Sync>,
}

/// One-shot kernel timer
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Create a disarmed timer running `func` at expiry
    pub fn new<F>(func: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TimerInner {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                func: Box::new(func),
            }),
        }
    }

    /// Timer ID
    pub fn id(&self) -> TimerId {
        self.inner.id
    }

    /// Fire after `delay`, replacing any pending deadline
    ///
    /// Returns whether the timer was pending.
    pub fn arm(&self, delay: Duration) -> bool {
        let svc = service();
        let mut q = svc.queue.lock();
        let was_pending = q.remove(self.inner.id);

        q.seq += 1;
        let key = (sched::ktime_get().saturating_add(delay), q.seq);
        q.pending.insert(key, self.inner.clone());
        q.armed.insert(self.inner.id, key);
        q.generation += 1;
        q.wake_all();
        was_pending
    }

    /// Whether the timer is armed and has not fired
    pub fn is_pending(&self) -> bool {
        service().queue.lock().armed.contains_key(&self.inner.id)
    }

    /// Disarm; returns whether the timer was pending
    ///
    /// A callback that already started keeps running.
    pub fn cancel(&self) -> bool {
        service().queue.lock().remove(self.inner.id)
    }

    /// Disarm and wait for a running callback to return
    ///
    /// Must not be called from the timer's own callback.
    pub fn cancel_sync(&self) -> bool {
        let svc = service();
        let id = self.inner.id;
        let was_pending = svc.queue.lock().remove(id);
        svc.queue.wait_event(|q| q.running != Some(id));
        was_pending
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("id", &self.inner.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Completion;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;
    use spin::Mutex;

    #[test]
    fn test_timer_fires_once() {
        let fired = Arc::new(Completion::new());
        let count = Arc::new(AtomicUsize::new(0));
        let (f, c) = (fired.clone(), count.clone());
        let timer = Timer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            f.complete();
        });

        assert!(!timer.arm(Duration::from_millis(2)));
        fired.wait();
        assert!(!timer.is_pending());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_cancel_before_expiry() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = Timer::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        timer.arm(Duration::from_secs(60));
        assert!(timer.is_pending());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Completion::new());
        let timers: Vec<_> = [30u64, 10, 20]
            .iter()
            .map(|&ms| {
                let order = order.clone();
                let done = done.clone();
                let t = Timer::new(move || {
                    order.lock().push(ms);
                    done.complete();
                });
                t.arm(Duration::from_millis(ms));
                t
            })
            .collect();
        for _ in 0..3 {
            done.wait();
        }
        assert_eq!(*order.lock(), [10, 20, 30]);
        drop(timers);
    }

    #[test]
    fn test_cancel_sync_waits_for_callback() {
        let entered = Arc::new(Completion::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let (e, f) = (entered.clone(), finished.clone());
        let timer = Timer::new(move || {
            e.complete();
            std::thread::sleep(std::time::Duration::from_millis(20));
            f.store(1, Ordering::SeqCst);
        });
        timer.arm(Duration::ZERO);
        entered.wait();
        assert!(!timer.cancel_sync());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
