// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Host Scheduler Seam
//!
//! Every primitive in this crate sleeps, wakes, reads the clock and creates
//! threads through the [`Host`] trait. The embedding kernel provides one
//! implementation; with the `std` feature an OS-thread backend is used when
//! nothing else was installed.
//!
//! # Example
//! ```ignore
//! use kcompat::sched::{self, Host};
//!
//! static HOST: MyKernelHost = MyKernelHost::new();
//! sched::install_host(&HOST)?;
//!
//! let task = sched::current();
//! task.wake_up();
//! ```

pub mod kthread;
pub mod task;

#[cfg(any(test, feature = "std"))]
pub mod std_host;

pub use kthread::{parkme, should_park, should_stop, Kthread};
pub use task::{Parker, Task, TaskId};

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::time::Duration;
use spin::Once;

use crate::error::{Error, Result};

/// ============================================================================
/// Host Trait
/// ============================================================================

/// Services the host kernel provides to the compatibility layer
pub trait Host: Send + Sync {
    /// Monotonic time since an arbitrary fixed point
    fn monotonic(&self) -> Duration;

    /// Number of CPUs work can be bound to
    fn cpu_count(&self) -> usize;

    /// Index of the CPU the caller runs on (`< cpu_count()`)
    fn current_cpu(&self) -> usize;

    /// Task handle of the calling thread
    fn current_task(&self) -> Arc<Task>;

    /// Start a new kernel thread running `entry`
    fn spawn(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> Result<()>;
}

/// ============================================================================
/// Global Host
/// ============================================================================

static HOST: Once<&'static dyn Host> = Once::new();

/// Install the host backend
///
/// Must happen before the first blocking call. Returns `Busy` if a host
/// (including the default one) is already in use.
pub fn install_host(host: &'static dyn Host) -> Result<()> {
    let mut installed = false;
    HOST.call_once(|| {
        installed = true;
        host
    });
    if installed {
        log::debug!("sched: host installed ({} cpus)", host.cpu_count());
        Ok(())
    } else {
        Err(Error::Busy)
    }
}

/// The active host backend
#[cfg(any(test, feature = "std"))]
pub fn host() -> &'static dyn Host {
    *HOST.call_once(|| &std_host::STD_HOST)
}

/// The active host backend
///
/// # Panics
///
/// Panics if [`install_host`] was never called.
#[cfg(not(any(test, feature = "std")))]
pub fn host() -> &'static dyn Host {
    match HOST.get() {
        Some(host) => *host,
        None => panic!("kcompat: no scheduler host installed"),
    }
}

/// ============================================================================
/// Convenience Wrappers
/// ============================================================================

/// The calling task
pub fn current() -> Arc<Task> {
    host().current_task()
}

/// Monotonic clock
pub fn ktime_get() -> Duration {
    host().monotonic()
}

/// Number of CPUs
pub fn num_cpus() -> usize {
    host().cpu_count().max(1)
}

/// CPU the caller runs on
pub fn current_cpu() -> usize {
    host().current_cpu() % num_cpus()
}

/// Sleep until woken or until `timeout` passes
///
/// Returns the time left, `Duration::MAX` when sleeping without a timeout.
pub fn schedule_timeout(timeout: Option<Duration>) -> Duration {
    let task = current();
    match timeout {
        None => {
            task.sleep(None);
            Duration::MAX
        }
        Some(timeout) => {
            let start = ktime_get();
            task.sleep(Some(timeout));
            timeout.saturating_sub(ktime_get().saturating_sub(start))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_host_is_busy() {
        let _ = host();
        assert_eq!(install_host(&std_host::STD_HOST), Err(Error::Busy));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = ktime_get();
        let b = ktime_get();
        assert!(b >= a);
        assert!(current_cpu() < num_cpus());
    }

    #[test]
    fn test_schedule_timeout_expires() {
        let left = schedule_timeout(Some(Duration::from_millis(5)));
        assert!(left <= Duration::from_millis(5));
    }
}
