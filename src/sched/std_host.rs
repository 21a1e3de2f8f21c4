// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! OS-thread host backend
//!
//! Maps tasks onto `std::thread` and parking onto `thread::park`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use spin::Once;
use std::cell::OnceCell;
use std::thread::{self, Thread};
use std::time::Instant;

use super::task::{Parker, Task};
use super::Host;
use crate::error::{Error, Result};

/// The default host used when nothing else was installed
pub static STD_HOST: StdHost = StdHost;

static EPOCH: Once<Instant> = Once::new();
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT: OnceCell<Arc<Task>> = const { OnceCell::new() };
    static CPU: OnceCell<usize> = const { OnceCell::new() };
}

struct StdParker {
    thread: Thread,
}

impl Parker for StdParker {
    fn park(&self, timeout: Option<Duration>) {
        debug_assert_eq!(thread::current().id(), self.thread.id());
        match timeout {
            Some(timeout) => thread::park_timeout(timeout),
            None => thread::park(),
        }
    }

    fn unpark(&self) {
        self.thread.unpark();
    }
}

/// Host backend built on the standard library
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHost;

impl Host for StdHost {
    fn monotonic(&self) -> Duration {
        EPOCH.call_once(Instant::now).elapsed()
    }

    fn cpu_count(&self) -> usize {
        thread::available_parallelism().map_or(1, |n| n.get())
    }

    fn current_cpu(&self) -> usize {
        // Threads are not pinned; give each one a stable CPU round-robin.
        CPU.with(|cpu| *cpu.get_or_init(|| NEXT_CPU.fetch_add(1, Ordering::Relaxed) % self.cpu_count()))
    }

    fn current_task(&self) -> Arc<Task> {
        CURRENT.with(|cur| {
            cur.get_or_init(|| {
                let thread = thread::current();
                let name = thread.name().unwrap_or("<unnamed>").to_owned();
                Arc::new(Task::new(&name, Box::new(StdParker { thread })))
            })
            .clone()
        })
    }

    fn spawn(&self, name: &str, entry: Box<dyn FnOnce() + Send>) -> Result<()> {
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(entry)
            .map(|_| ())
            .map_err(|err| {
                log::error!("std_host: failed to spawn {}: {}", name, err);
                Error::OutOfMemory
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawn_runs_entry() {
        let (tx, rx) = mpsc::channel();
        STD_HOST
            .spawn("spawn-test", Box::new(move || tx.send(thread::current().name().map(String::from)).unwrap()))
            .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("spawn-test"));
    }

    #[test]
    fn test_unpark_before_park_is_not_lost() {
        let task = STD_HOST.current_task();
        task.wake_up();
        // Returns immediately thanks to the stored token.
        task.sleep(None);
    }
}
