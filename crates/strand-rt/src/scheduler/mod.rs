// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! N:M scheduler.
//!
//! A fixed pool of OS worker threads pulls tasks from one shared queue and
//! runs them as coroutines. What a worker does when the queue has nothing
//! for it is delegated to a [`Driver`]: the plain [`Scheduler`] parks on a
//! condition variable, the reactor blocks in epoll.
//!
//! With `use_caller`, the constructing thread is one of the workers. Its
//! worker loop lives in a root coroutine that `stop()` drives to completion.

mod task;

pub use task::{Job, Task};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::context::{self, EnterGuard};
use crate::coroutine::{Coroutine, State};
use crate::error::RuntimeError;
use task::TaskQueue;

/// Anything tasks can be pushed onto. Used by wait paths that only know
/// "the scheduler this coroutine came from".
pub(crate) trait Schedule: Send + Sync {
    fn schedule_task(&self, task: Task);
}

/// Behavior a scheduler flavor plugs into the shared worker loop.
pub(crate) trait Driver: Send + Sync + Sized + 'static {
    /// Wake idle workers because work arrived or stop was requested.
    fn tickle(&self, core: &Core<Self>);

    /// Body of every worker's idle coroutine. Suspends after each wait
    /// and returns once the scheduler is stopping.
    fn idle(&self, core: &Arc<Core<Self>>);

    fn stopping(&self, core: &Core<Self>) -> bool {
        core.base_stopping()
    }

    /// Bind the calling worker thread to `core`.
    fn enter(core: &Arc<Core<Self>>) -> EnterGuard;
}

/// State shared by all workers of one scheduler.
pub(crate) struct Core<D: Driver> {
    name: String,
    queue: TaskQueue,
    /// Tasks taken from the queue and not yet finished running.
    active: AtomicUsize,
    /// Workers currently inside their idle coroutine.
    idle: AtomicUsize,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    /// Spawned worker threads, not counting a use-caller thread.
    spawn_count: usize,
    thread_ids: Mutex<Vec<ThreadId>>,
    pub(crate) driver: D,
}

impl<D: Driver> Core<D> {
    pub(crate) fn new(name: &str, threads: usize, use_caller: bool, driver: D) -> Self {
        assert!(threads > 0, "scheduler needs at least one thread");
        let spawn_count = if use_caller { threads - 1 } else { threads };
        Self {
            name: name.to_string(),
            queue: TaskQueue::new(),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            spawn_count,
            thread_ids: Mutex::new(Vec::with_capacity(threads)),
            driver,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn push(&self, task: Task) {
        if self.queue.push(task) {
            self.tickle();
        }
    }

    pub(crate) fn push_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        if self.queue.push_batch(tasks) {
            self.tickle();
        }
    }

    pub(crate) fn tickle(&self) {
        self.driver.tickle(self);
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Stop was requested, the queue is drained and nothing is running.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested()
            && self.queue.is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    pub(crate) fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    pub(crate) fn thread_ids(&self) -> Vec<ThreadId> {
        self.thread_ids.lock().clone()
    }
}

impl<D: Driver> Schedule for Core<D> {
    fn schedule_task(&self, task: Task) {
        self.push(task);
    }
}

/// Schedule a closure on the scheduler that runs the calling worker.
/// Returns false when the caller is not a worker thread.
pub fn spawn<F>(f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    match context::current_scheduler() {
        Some(sched) => {
            sched.schedule_task(Task::call(f));
            true
        }
        None => false,
    }
}

/// Per-thread worker loop.
fn run_worker<D: Driver>(core: &Arc<Core<D>>) {
    let _bound = D::enter(core);
    let me = thread::current().id();
    tracing::debug!(scheduler = %core.name, "worker running");

    let idle_co = {
        let core = core.clone();
        Coroutine::new(move || core.driver.idle(&core))
    };
    let mut call_co: Option<Arc<Coroutine>> = None;

    loop {
        let take = core.queue.take_for(me, || {
            core.active.fetch_add(1, Ordering::AcqRel);
        });
        if take.more && take.task.is_some() {
            core.tickle();
        }

        if let Some(task) = take.task {
            let _active = ActiveGuard(&core.active);
            run_task(core, task, &mut call_co);
            continue;
        }

        if take.busy {
            // The only work left is a coroutine still switching out on
            // another thread. It will be runnable in a moment.
            thread::yield_now();
            continue;
        }

        core.idle.fetch_add(1, Ordering::AcqRel);
        let state = idle_co.resume();
        core.idle.fetch_sub(1, Ordering::AcqRel);
        if state.is_finished() {
            break;
        }
    }

    tracing::debug!(scheduler = %core.name, "worker exiting");
}

/// Releases a task's slot in `active` even when the task unwinds the
/// worker, so `stop()` can still observe the pool as drained.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_task<D: Driver>(core: &Core<D>, task: Task, call_co: &mut Option<Arc<Coroutine>>) {
    let affinity = task.affinity;
    let (co, owned) = match task.job {
        Job::Coroutine(co) => {
            if co.state().is_finished() {
                return;
            }
            (co, false)
        }
        Job::Call(f) => match call_co.take() {
            Some(co) => {
                co.reset(f);
                (co, true)
            }
            None => (Coroutine::new(f), true),
        },
    };

    match co.resume() {
        State::Ready => core.push(Task {
            job: Job::Coroutine(co),
            affinity,
        }),
        // Only the worker's own closure coroutine is recycled.
        State::Term | State::Except if owned => *call_co = Some(co),
        // Hold: whoever suspended it owns waking it. If nobody does, the
        // drop below is a fatal programming error on this worker.
        State::Hold if Arc::strong_count(&co) == 1 => {
            tracing::error!(
                scheduler = %core.name,
                coroutine = co.id(),
                "suspended coroutine has no owner to resume it"
            );
        }
        _ => {}
    }
}

/// Owner of a running pool: spawned threads plus the optional root
/// coroutine of a use-caller thread.
pub(crate) struct Pool<D: Driver> {
    core: Arc<Core<D>>,
    caller: Option<ThreadId>,
    root: Mutex<Option<Arc<Coroutine>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<D: Driver> Pool<D> {
    pub(crate) fn new(core: Arc<Core<D>>, use_caller: bool) -> Self {
        let (caller, root) = if use_caller {
            let me = thread::current().id();
            core.thread_ids.lock().push(me);
            let root = {
                let core = core.clone();
                Coroutine::new(move || run_worker(&core))
            };
            (Some(me), Some(root))
        } else {
            (None, None)
        };

        Self {
            core,
            caller,
            root: Mutex::new(root),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core<D>> {
        &self.core
    }

    /// Spawn the worker threads. Calling it again is a no-op.
    pub(crate) fn start(&self) -> Result<(), RuntimeError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        assert!(!self.core.stop_requested(), "scheduler started after stop");

        let mut threads = self.threads.lock();
        for i in 0..self.core.spawn_count {
            let core = self.core.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.core.name, i))
                .spawn(move || run_worker(&core))?;
            self.core.thread_ids.lock().push(handle.thread().id());
            threads.push(handle);
        }
        tracing::info!(
            scheduler = %self.core.name,
            threads = self.core.spawn_count,
            use_caller = self.caller.is_some(),
            "scheduler started"
        );
        Ok(())
    }

    /// Request stop, wake everyone, drive the root coroutine if this pool
    /// uses the caller thread, then join the workers.
    pub(crate) fn stop(&self) {
        if self.core.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Some(caller) = self.caller {
            assert_eq!(
                thread::current().id(),
                caller,
                "use-caller scheduler must be stopped from its creating thread"
            );
        }

        tracing::info!(scheduler = %self.core.name, "scheduler stopping");
        self.core.stop_requested.store(true, Ordering::Release);
        for _ in 0..self.core.spawn_count {
            self.core.tickle();
        }

        let root = self.root.lock().take();
        if let Some(root) = root {
            self.core.tickle();
            if !root.state().is_finished() {
                root.resume();
            }
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(scheduler = %self.core.name, "worker thread panicked");
            }
        }

        self.core.stopped.store(true, Ordering::Release);
        tracing::info!(scheduler = %self.core.name, "scheduler stopped");
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.core.stopped.load(Ordering::Acquire)
    }
}

impl<D: Driver> Drop for Pool<D> {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let never_started = !self.started.load(Ordering::Acquire) && self.caller.is_none();
        if !self.is_stopped() && !never_started {
            tracing::error!(scheduler = %self.core.name, "scheduler dropped while running");
            panic!("scheduler `{}` dropped before stop()", self.core.name);
        }
    }
}

/// Idle behavior of the plain scheduler: park on a condition variable.
pub(crate) struct Parker {
    signaled: Mutex<bool>,
    cond: Condvar,
}

const PARK_TIMEOUT: Duration = Duration::from_millis(10);

impl Parker {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl Driver for Parker {
    fn tickle(&self, core: &Core<Self>) {
        *self.signaled.lock() = true;
        tracing::trace!(scheduler = %core.name, "tickle");
        self.cond.notify_all();
    }

    fn idle(&self, core: &Arc<Core<Self>>) {
        while !core.stopping() {
            {
                let mut signaled = self.signaled.lock();
                if !*signaled && !core.stop_requested() {
                    self.cond.wait_for(&mut signaled, PARK_TIMEOUT);
                }
                *signaled = false;
            }
            Coroutine::suspend();
        }
    }

    fn enter(core: &Arc<Core<Self>>) -> EnterGuard {
        context::enter(core.clone(), None)
    }
}

/// Thread pool running closures and coroutines cooperatively.
///
/// ```no_run
/// use strand_rt::Scheduler;
///
/// let sched = Scheduler::new(4, false, "pool");
/// sched.start().unwrap();
/// sched.schedule(|| println!("hello from a coroutine"));
/// sched.stop();
/// ```
pub struct Scheduler {
    pool: Pool<Parker>,
}

impl Scheduler {
    /// `threads` counts the caller when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        let core = Arc::new(Core::new(name, threads, use_caller, Parker::new()));
        Self {
            pool: Pool::new(core, use_caller),
        }
    }

    pub fn start(&self) -> Result<(), RuntimeError> {
        self.pool.start()
    }

    /// Stop once all queued and running work has drained. Must be called
    /// before the scheduler is dropped.
    pub fn stop(&self) {
        self.pool.stop();
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.core().push(Task::call(f));
    }

    /// Run `f` only on the worker thread `thread`.
    pub fn schedule_on<F>(&self, f: F, thread: ThreadId)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.core().push(Task::call(f).pinned_to(thread));
    }

    pub fn schedule_coroutine(&self, co: Arc<Coroutine>) {
        self.pool.core().push(Task::coroutine(co));
    }

    pub fn schedule_task(&self, task: Task) {
        self.pool.core().push(task);
    }

    /// Enqueue many tasks under one lock.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.pool.core().push_batch(tasks);
    }

    pub fn name(&self) -> &str {
        self.pool.core().name()
    }

    /// Ids of the worker threads, the caller first in use-caller mode.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.pool.core().thread_ids()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.pool.core().idle_count() > 0
    }

    pub fn stopping(&self) -> bool {
        self.pool.core().stopping()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name())
            .field("stopped", &self.pool.is_stopped())
            .finish()
    }
}
