// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Worker threads

use alloc::collections::VecDeque;
use spin::Once;

use super::work::{Work, EXEC_STATES, WORK_ST_CANCEL, WORK_ST_TASK, WORK_ST_TIMER};
use super::WqShared;
use crate::sched::{kthread, TaskId};
use crate::sync::WaitQueue;

/// One worker: a FIFO and the kthread that serves it
pub(crate) struct Worker {
    pub(crate) fifo: WaitQueue<VecDeque<Work>>,
    task: Once<TaskId>,
}

impl Worker {
    pub(crate) fn new() -> Self {
        Self {
            fifo: WaitQueue::with_state(VecDeque::new()),
            task: Once::new(),
        }
    }

    pub(crate) fn task_id(&self) -> Option<TaskId> {
        self.task.get().copied()
    }

    pub(crate) fn set_task_id(&self, id: TaskId) {
        self.task.call_once(|| id);
    }
}

/// Worker kthread body
///
/// Pops items in FIFO order and runs them with the `exec` lock dropped.
/// Exits once asked to stop and the FIFO is empty.
pub(crate) fn worker_thread(wq: &WqShared, idx: usize) -> i32 {
    let worker = &wq.workers[idx];

    loop {
        worker
            .fifo
            .wait_event(|fifo| !fifo.is_empty() || kthread::should_stop() || kthread::should_park());
        if kthread::should_park() {
            kthread::parkme();
            continue;
        }

        let mut exec = wq.exec.lock();
        let Some(work) = worker.fifo.lock().pop_front() else {
            drop(exec);
            if kthread::should_stop() {
                break;
            }
            continue;
        };

        exec.start(&work, idx);
        loop {
            match work.update_state(&EXEC_STATES) {
                WORK_ST_TIMER | WORK_ST_TASK | WORK_ST_CANCEL => {
                    drop(exec);
                    log::trace!("workqueue {}: running {:?}", wq.name, work);
                    work.run();
                    exec = wq.exec.lock();
                    if !exec.take_rerun(&work, idx) {
                        break;
                    }
                }
                _ => break,
            }
        }
        exec.finish(&work, idx);
        exec.wake_all();
    }

    log::debug!("workqueue {}: worker {} exiting", wq.name, idx);
    0
}
