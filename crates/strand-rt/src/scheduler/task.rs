// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks and the shared task queue.
//!
//! One mutex-protected FIFO per scheduler. Workers scan from the front for
//! the first task they are allowed to run: unpinned or pinned to their own
//! thread, and not a coroutine that is still executing elsewhere.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::coroutine::{Coroutine, State};

/// What a task runs.
pub enum Job {
    /// Resume an existing coroutine.
    Coroutine(Arc<Coroutine>),
    /// Run a closure inside a worker-owned coroutine.
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// A unit of work with optional thread affinity.
pub struct Task {
    pub(crate) job: Job,
    pub(crate) affinity: Option<ThreadId>,
}

impl Task {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Job::Call(Box::new(f)),
            affinity: None,
        }
    }

    pub fn coroutine(co: Arc<Coroutine>) -> Self {
        Self {
            job: Job::Coroutine(co),
            affinity: None,
        }
    }

    /// Only run this task on the given worker thread.
    pub fn pinned_to(mut self, thread: ThreadId) -> Self {
        self.affinity = Some(thread);
        self
    }

    pub fn affinity(&self) -> Option<ThreadId> {
        self.affinity
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Task");
        match &self.job {
            Job::Coroutine(co) => d.field("coroutine", &co.id()),
            Job::Call(_) => d.field("call", &"<closure>"),
        };
        d.field("affinity", &self.affinity).finish()
    }
}

/// Result of scanning the queue on behalf of one worker.
pub(crate) struct Take {
    pub task: Option<Task>,
    /// Tasks remain that another worker should look at.
    pub more: bool,
    /// A coroutine was skipped only because it is still executing.
    pub busy: bool,
}

pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append one task. Returns true if the queue was empty before.
    pub fn push(&self, task: Task) -> bool {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty
    }

    /// Append many tasks under one lock. Returns true if the queue was
    /// empty before and at least one task was added.
    pub fn push_batch<I>(&self, tasks: I) -> bool
    where
        I: IntoIterator<Item = Task>,
    {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        let before = q.len();
        q.extend(tasks);
        was_empty && q.len() > before
    }

    /// Remove the first task `thread` may run. `on_take` runs under the
    /// queue lock when a task is taken, so counters it bumps are consistent
    /// with the queue contents seen by `is_empty`.
    pub fn take_for(&self, thread: ThreadId, on_take: impl FnOnce()) -> Take {
        let mut q = self.queue.lock();
        let mut busy = false;
        let mut pinned_elsewhere = false;
        let mut found = None;

        for (idx, task) in q.iter().enumerate() {
            if task.affinity.is_some_and(|t| t != thread) {
                pinned_elsewhere = true;
                continue;
            }
            if let Job::Coroutine(co) = &task.job {
                if co.state() == State::Exec {
                    busy = true;
                    continue;
                }
            }
            found = Some(idx);
            break;
        }

        let task = found.and_then(|idx| q.remove(idx));
        if task.is_some() {
            on_take();
        }
        let more = pinned_elsewhere
            || match found {
                Some(idx) => idx < q.len(),
                None => false,
            };
        Take { task, more, busy }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}
