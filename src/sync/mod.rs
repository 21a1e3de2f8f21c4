// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Synchronization Primitives
//!
//! This module provides the blocking primitives every higher-level wait in
//! this crate is built from.
//!
//! # Primitives
//!
//! - **WaitQueue**: Queue of tasks waiting for a condition, with the
//!   condition's state guarded by the queue's own lock
//! - **Completion**: Counted one-shot/multi-shot wakeup
//!
//! # Design
//!
//! State is mutated and waiters are woken under the same lock a waiter holds
//! while registering and re-checking its condition, so a wakeup that follows
//! a state change can never be missed.

pub mod completion;
pub mod wait_queue;

// Re-exports
pub use completion::Completion;
pub use wait_queue::{default_wake_function, WaitQueue, WaitQueueEntry, WaitQueueGuard};
