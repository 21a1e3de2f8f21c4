// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Work Queues
//!
//! Deferred execution on long-lived worker kthreads. Each worker owns one
//! FIFO; a bound queue has one worker per CPU, an ordered or unbound queue
//! has a single worker.
//!
//! # Design
//!
//! - **Single execution**: Queuing an item that is already queued is a
//!   no-op; queuing an item that is running marks it to run once more on
//!   the same worker
//! - **Execution records**: Which worker runs which item is tracked under
//!   one lock (`exec`), which is also the wait queue cancel and flush
//!   sleep on
//! - **Barriers**: `flush` queues a barrier item behind everything already
//!   queued on each worker and waits for all of them
//!
//! # Usage
//!
//! ```ignore
//! let wq = WorkQueue::alloc("events_io", WqFlags::UNBOUND, 0)?;
//! let work = Work::new(|_| log::info!("ran"));
//! wq.queue(&work);
//! wq.flush();
//! ```

mod delayed;
mod work;
mod worker;

pub use delayed::DelayedWork;
pub use work::{CancelResult, Work, WorkFn};

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use spin::{Mutex, Once};

use crate::error::Result;
use crate::sched::{self, Kthread};
use crate::sync::{Completion, WaitQueue};
use work::{QUEUE_STATES, WORK_ST_CANCEL, WORK_ST_EXEC, WORK_ST_IDLE};
use worker::Worker;

/// ============================================================================
/// Configuration
/// ============================================================================

bitflags::bitflags! {
    /// Work queue creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WqFlags: u32 {
        /// Not bound to a CPU
        const UNBOUND = 1 << 1;
        /// Parked by [`WorkQueue::freeze`]
        const FREEZABLE = 1 << 2;
        /// May be used on the memory reclaim path
        const MEM_RECLAIM = 1 << 3;
        /// High priority workers
        const HIGHPRI = 1 << 4;
        /// At most one item runs at a time, in queuing order
        const ORDERED = 1 << 17;
    }
}

/// Default `max_active`
pub const WQ_DFL_ACTIVE: usize = 256;

/// Upper bound for `max_active`
pub const WQ_MAX_ACTIVE: usize = 512;

/// Warn about a drain that does not converge after this many flushes
const DRAIN_WARN_FLUSHES: usize = 10;

/// ============================================================================
/// Execution Records
/// ============================================================================

struct ExecRecord {
    work: Work,
    worker: usize,
    rerun: bool,
}

/// Items currently running, one record per worker at most
#[derive(Default)]
pub(crate) struct ExecState {
    records: Vec<ExecRecord>,
}

impl ExecState {
    /// Whether some worker is running `work`
    pub(crate) fn is_executing(&self, work: &Work) -> bool {
        self.records.iter().any(|r| Work::ptr_eq(&r.work, work))
    }

    /// Ask the worker running `work` to run it once more
    fn unblock(&mut self, work: &Work) -> bool {
        match self.records.iter_mut().find(|r| Work::ptr_eq(&r.work, work) && !r.rerun) {
            Some(record) => {
                record.rerun = true;
                true
            }
            None => false,
        }
    }

    fn start(&mut self, work: &Work, worker: usize) {
        self.records.push(ExecRecord {
            work: work.clone(),
            worker,
            rerun: false,
        });
    }

    /// Consume a pending rerun of `work` on `worker`
    fn take_rerun(&mut self, work: &Work, worker: usize) -> bool {
        match self
            .records
            .iter_mut()
            .find(|r| r.worker == worker && Work::ptr_eq(&r.work, work))
        {
            Some(record) if record.rerun => {
                record.rerun = false;
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self, work: &Work, worker: usize) {
        if let Some(pos) = self
            .records
            .iter()
            .position(|r| r.worker == worker && Work::ptr_eq(&r.work, work))
        {
            self.records.swap_remove(pos);
        }
    }
}

/// ============================================================================
/// Shared Queue State
/// ============================================================================

/// State shared by a [`WorkQueue`], its workers and the items queued on it
pub(crate) struct WqShared {
    name: String,
    flags: WqFlags,
    max_active: usize,
    workers: Vec<Worker>,
    pub(crate) exec: WaitQueue<ExecState>,
    draining: AtomicUsize,
    dead: AtomicBool,
}

impl WqShared {
    fn pick_worker(&self, cpu: Option<usize>) -> usize {
        let n = self.workers.len();
        if n <= 1 {
            return 0;
        }
        cpu.unwrap_or_else(sched::current_cpu) % n
    }

    /// Whether the caller is one of this queue's workers
    pub(crate) fn is_current_worker(&self) -> bool {
        let id = sched::current().id();
        self.workers.iter().any(|w| w.task_id() == Some(id))
    }

    fn refuses_work(&self) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return true;
        }
        // Items already on the queue may still chain more work while draining.
        self.draining.load(Ordering::Acquire) != 0 && !self.is_current_worker()
    }

    /// Append `work` to a worker FIFO; the caller already moved its state
    pub(crate) fn enqueue(self: &Arc<Self>, work: &Work, cpu: Option<usize>) {
        work.set_queue(self);
        let idx = self.pick_worker(cpu);
        let mut fifo = self.workers[idx].fifo.lock();
        fifo.push_back(work.clone());
        fifo.wake_all();
    }

    /// Mark a running `work` to run again instead of queuing it
    pub(crate) fn exec_unblock(&self, work: &Work) -> bool {
        self.exec.lock().unblock(work)
    }

    fn queue_work(self: &Arc<Self>, work: &Work, cpu: Option<usize>) -> bool {
        if self.refuses_work() {
            log::warn!("workqueue {}: queuing refused while draining or destroyed", self.name);
            return false;
        }

        // Held across the FIFO push so cancel never sees a half-queued item.
        let mut exec = self.exec.lock();
        match work.update_state(&QUEUE_STATES) {
            WORK_ST_EXEC | WORK_ST_CANCEL => {
                if !exec.unblock(work) {
                    self.enqueue(work, cpu);
                }
                true
            }
            WORK_ST_IDLE => {
                self.enqueue(work, cpu);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_executing(&self, work: &Work) -> bool {
        self.exec.lock().is_executing(work)
    }

    fn is_queued(&self, work: &Work) -> bool {
        self.workers
            .iter()
            .any(|w| w.fifo.lock().iter().any(|q| Work::ptr_eq(q, work)))
    }

    /// Take `work` off whichever FIFO holds it
    ///
    /// The caller holds the `exec` lock.
    pub(crate) fn remove_queued(&self, work: &Work) -> bool {
        for worker in &self.workers {
            let mut fifo = worker.fifo.lock();
            if let Some(pos) = fifo.iter().position(|q| Work::ptr_eq(q, work)) {
                fifo.remove(pos);
                return true;
            }
        }
        false
    }

    /// Sleep until `work` is neither queued nor running
    pub(crate) fn drain_work(&self, work: &Work) {
        self.exec
            .wait_event(|exec| !exec.is_executing(work) && !self.is_queued(work));
    }

    fn is_idle(&self) -> bool {
        let exec = self.exec.lock();
        exec.records.is_empty() && self.workers.iter().all(|w| w.fifo.lock().is_empty())
    }

    fn flush(self: &Arc<Self>) {
        if self.is_current_worker() {
            log::warn!("workqueue {}: flush from own worker skipped", self.name);
            return;
        }

        let done = Arc::new(Completion::new());
        for idx in 0..self.workers.len() {
            let done = done.clone();
            let barrier = Work::new(move |_| done.complete());
            barrier.update_state(&QUEUE_STATES);
            self.enqueue(&barrier, Some(idx));
        }
        for _ in 0..self.workers.len() {
            done.wait();
        }
    }

    fn drain(self: &Arc<Self>) {
        if self.is_current_worker() {
            log::warn!("workqueue {}: drain from own worker skipped", self.name);
            return;
        }

        self.draining.fetch_add(1, Ordering::AcqRel);
        let mut flushes = 0usize;
        loop {
            self.flush();
            if self.is_idle() {
                break;
            }
            flushes += 1;
            if flushes == DRAIN_WARN_FLUSHES || (flushes % 100 == 0 && flushes <= 1000) {
                log::warn!("workqueue {}: drain isn't complete after {} tries", self.name, flushes);
            }
        }
        self.draining.fetch_sub(1, Ordering::AcqRel);
    }
}

/// ============================================================================
/// Work Queue
/// ============================================================================

/// A named set of worker threads
pub struct WorkQueue {
    shared: Arc<WqShared>,
    threads: Mutex<Vec<Kthread>>,
}

impl WorkQueue {
    /// Create a queue and start its workers
    ///
    /// `max_active` of 0 selects [`WQ_DFL_ACTIVE`]; larger values are
    /// clamped to [`WQ_MAX_ACTIVE`]. Ordered and unbound queues get one
    /// worker, bound queues one per CPU up to `max_active`.
    pub fn alloc(name: &str, flags: WqFlags, max_active: usize) -> Result<Self> {
        let max_active = match max_active {
            0 => WQ_DFL_ACTIVE,
            n => n.min(WQ_MAX_ACTIVE),
        };
        let nr_workers = if flags.intersects(WqFlags::ORDERED | WqFlags::UNBOUND) {
            1
        } else {
            sched::num_cpus().clamp(1, max_active)
        };

        let shared = Arc::new(WqShared {
            name: String::from(name),
            flags,
            max_active,
            workers: (0..nr_workers).map(|_| Worker::new()).collect(),
            exec: WaitQueue::with_state(ExecState::default()),
            draining: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(nr_workers);
        for idx in 0..nr_workers {
            let thread_shared = shared.clone();
            // Threads already started are stopped by their handles on error.
            let thread = Kthread::run(&format!("{}/{}", name, idx), move || {
                worker::worker_thread(&thread_shared, idx)
            })?;
            shared.workers[idx].set_task_id(thread.task().id());
            threads.push(thread);
        }

        log::debug!(
            "workqueue {}: allocated ({} workers, flags {:?}, max_active {})",
            name,
            nr_workers,
            flags,
            max_active
        );
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Creation flags
    pub fn flags(&self) -> WqFlags {
        self.shared.flags
    }

    /// Effective `max_active`
    pub fn max_active(&self) -> usize {
        self.shared.max_active
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Queue `work` on the worker of the calling CPU
    ///
    /// Returns `false` if it was already pending or the queue is draining.
    pub fn queue(&self, work: &Work) -> bool {
        self.shared.queue_work(work, None)
    }

    /// Queue `work` on the worker serving `cpu`
    pub fn queue_on(&self, cpu: usize, work: &Work) -> bool {
        self.shared.queue_work(work, Some(cpu))
    }

    /// Queue `dwork` after `delay`
    pub fn queue_delayed(&self, dwork: &DelayedWork, delay: Duration) -> bool {
        dwork.queue(self, delay)
    }

    /// Wait for every item queued before this call to finish
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Flush until the queue is empty
    ///
    /// Queuing from outside the queue's own workers is refused meanwhile.
    pub fn drain(&self) {
        self.shared.drain();
    }

    /// Park the workers of a freezable queue
    pub fn freeze(&self) {
        if !self.shared.flags.contains(WqFlags::FREEZABLE) {
            return;
        }
        for thread in self.threads.lock().iter() {
            if let Err(err) = thread.park() {
                log::warn!("workqueue {}: freeze: {}", self.shared.name, err);
            }
        }
        log::debug!("workqueue {}: frozen", self.shared.name);
    }

    /// Resume the workers of a frozen queue
    pub fn thaw(&self) {
        if !self.shared.flags.contains(WqFlags::FREEZABLE) {
            return;
        }
        for thread in self.threads.lock().iter() {
            thread.unpark();
        }
        log::debug!("workqueue {}: thawed", self.shared.name);
    }

    /// Whether a freeze is in effect
    pub fn is_frozen(&self) -> bool {
        self.threads.lock().iter().any(Kthread::is_parked)
    }

    /// Drain the queue and stop its workers
    pub fn destroy(self) {}

    fn shutdown(&mut self) {
        let threads = core::mem::take(self.threads.get_mut());
        if threads.is_empty() {
            return;
        }
        for thread in &threads {
            thread.unpark();
        }
        // Keep refusing outside work between the drain and the stop.
        self.shared.draining.fetch_add(1, Ordering::AcqRel);
        self.shared.drain();
        self.shared.dead.store(true, Ordering::Release);
        for thread in threads {
            thread.stop();
        }
        log::debug!("workqueue {}: destroyed", self.shared.name);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("flags", &self.shared.flags)
            .field("workers", &self.shared.workers.len())
            .finish()
    }
}

/// ============================================================================
/// System Queues
/// ============================================================================

static SYSTEM_WQ: Once<Result<WorkQueue>> = Once::new();
static SYSTEM_UNBOUND_WQ: Once<Result<WorkQueue>> = Once::new();
static SYSTEM_LONG_WQ: Once<Result<WorkQueue>> = Once::new();

fn system_queue(slot: &'static Once<Result<WorkQueue>>, name: &str, flags: WqFlags) -> Result<&'static WorkQueue> {
    match slot.call_once(|| WorkQueue::alloc(name, flags, 0)) {
        Ok(wq) => Ok(wq),
        Err(err) => Err(*err),
    }
}

/// Shared bound queue, started on first use
pub fn system_wq() -> Result<&'static WorkQueue> {
    system_queue(&SYSTEM_WQ, "events", WqFlags::empty())
}

/// Shared unbound queue
pub fn system_unbound_wq() -> Result<&'static WorkQueue> {
    system_queue(&SYSTEM_UNBOUND_WQ, "events_unbound", WqFlags::UNBOUND)
}

/// Shared queue for items that may run for a long time
pub fn system_long_wq() -> Result<&'static WorkQueue> {
    system_queue(&SYSTEM_LONG_WQ, "events_long", WqFlags::empty())
}

/// Queue `work` on the system queue
pub fn schedule_work(work: &Work) -> bool {
    match system_wq() {
        Ok(wq) => wq.queue(work),
        Err(err) => {
            log::error!("workqueue: no system queue: {}", err);
            false
        }
    }
}

/// Queue `dwork` on the system queue after `delay`
pub fn schedule_delayed_work(dwork: &DelayedWork, delay: Duration) -> bool {
    match system_wq() {
        Ok(wq) => dwork.queue(wq, delay),
        Err(err) => {
            log::error!("workqueue: no system queue: {}", err);
            false
        }
    }
}

/// Wait for everything queued on the system queue so far
pub fn flush_scheduled_work() {
    if let Ok(wq) = system_wq() {
        wq.flush();
    }
}

/// ============================================================================
/// Deferred Calls
/// ============================================================================

/// Private to [`defer`]; user items never run here, so they can wait on
/// whatever a deferred call signals.
static DEFER_WQ: Once<Result<WorkQueue>> = Once::new();

fn defer_wq() -> Result<&'static WorkQueue> {
    system_queue(&DEFER_WQ, "kdeferd", WqFlags::ORDERED)
}

/// Run `f` once from process context, on a queue of its own
///
/// Calls run in order. Runs `f` right away if it cannot be queued.
pub fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let slot = Mutex::new(Some(f));
    let work = Work::new(move |_| {
        if let Some(f) = slot.lock().take() {
            f();
        }
    });
    let queued = match defer_wq() {
        Ok(wq) => wq.queue(&work),
        Err(err) => {
            log::error!("workqueue: no deferral queue: {}", err);
            false
        }
    };
    if !queued {
        work.run();
    }
}

/// Wait for every call deferred so far
pub fn flush_deferred() {
    if let Ok(wq) = defer_wq() {
        wq.flush();
    }
}
