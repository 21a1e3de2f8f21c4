// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Error Types
//!
//! One error type is shared by every primitive in this crate. Values map to
//! negative Linux errno codes so drivers that expect `-ETIMEDOUT` and friends
//! can use `to_errno()` directly.

use core::fmt;

/// ============================================================================
/// Errno Values
/// ============================================================================

/// Linux errno values used by the compatibility layer (positive form)
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EDEADLK: i32 = 35;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECANCELED: i32 = 125;
    /// Kernel-internal "restart the syscall" code returned by interrupted waits
    pub const ERESTARTSYS: i32 = 512;
}

/// ============================================================================
/// Error
/// ============================================================================

/// Errors returned by synchronization primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Fence already signaled, or callback registration raced a signal
    AlreadyDone,
    /// Wait aborted by a signal delivered to the waiting task
    Interrupted,
    /// Deadline passed before the condition held
    TimedOut,
    /// Item was never queued or already ran
    NotFound,
    /// Resource is in use or already initialized
    Busy,
    /// Invalid argument
    InvalidArgument,
    /// Allocation or thread creation failed
    OutOfMemory,
    /// Sticky fence error (negative errno)
    Fence(i32),
}

impl Error {
    /// Convert to a negative errno value
    pub fn to_errno(self) -> i32 {
        match self {
            Error::AlreadyDone => -errno::ENOENT,
            Error::Interrupted => -errno::ERESTARTSYS,
            Error::TimedOut => -errno::ETIMEDOUT,
            Error::NotFound => -errno::ENOENT,
            Error::Busy => -errno::EBUSY,
            Error::InvalidArgument => -errno::EINVAL,
            Error::OutOfMemory => -errno::ENOMEM,
            Error::Fence(e) => e,
        }
    }

    /// Convert from a negative errno value
    ///
    /// Codes without a dedicated variant are carried as [`Error::Fence`].
    pub fn from_errno(e: i32) -> Self {
        match -e {
            errno::ERESTARTSYS | errno::EINTR => Error::Interrupted,
            errno::ETIMEDOUT => Error::TimedOut,
            errno::ENOENT => Error::NotFound,
            errno::EBUSY => Error::Busy,
            errno::EINVAL => Error::InvalidArgument,
            errno::ENOMEM => Error::OutOfMemory,
            _ => Error::Fence(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyDone => write!(f, "already signaled"),
            Error::Interrupted => write!(f, "wait interrupted"),
            Error::TimedOut => write!(f, "wait timed out"),
            Error::NotFound => write!(f, "not found"),
            Error::Busy => write!(f, "resource busy"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Fence(e) => write!(f, "fence error {}", e),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for Error {}

/// Result type for synchronization operations
pub type Result<T> = core::result::Result<T, Error>;
