// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Synchronization Compatibility Layer
//!
//! This crate provides the Linux-style synchronization primitives that
//! graphics and network drivers are written against, implemented on top of
//! a host kernel's own threads, locks and scheduler.
//!
//! # Components
//!
//! - **kref**: Saturating reference counter and intrusive shared pointer
//! - **sync**: Wait queues and completions
//! - **fence**: DMA fences, fence arrays and fence chains
//! - **workqueue**: Deferred work, delayed work and system queues
//! - **sched**: Host scheduler seam, tasks and kernel threads
//!
//! # Host integration
//!
//! Every blocking primitive sleeps through [`sched::Host`]. With the `std`
//! feature (enabled by default) an OS-thread backend is used automatically;
//! a bare kernel installs its own with [`sched::install_host`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod error;
pub mod fence;
pub mod kref;
pub mod sched;
pub mod sync;
pub mod timer;
pub mod workqueue;

#[cfg(test)]
mod tests;

// Re-exports
pub use error::{Error, Result};
pub use fence::{Fence, FenceArray, FenceChain, FenceOps, FenceRef};
pub use kref::{Kref, Ref, RefCounted};
pub use sched::{Kthread, Task};
pub use sync::{Completion, WaitQueue, WaitQueueEntry};
pub use workqueue::{CancelResult, DelayedWork, Work, WorkQueue, WqFlags};
