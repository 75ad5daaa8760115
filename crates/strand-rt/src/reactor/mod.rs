// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: a scheduler whose idle workers block in epoll.
//!
//! Coroutines (or callbacks) register interest in one direction of a
//! descriptor; when epoll reports it ready the waiter is pushed onto the
//! task queue. Nothing is ever resumed from inside the poll loop.
//!
//! Timers share the same wait: an idle worker blocks no longer than the
//! earliest deadline, capped at `reactor.max_poll_ms`, and a timer that
//! becomes the new earliest one tickles the pipe so the wait is recomputed.

mod fd_slots;
mod poller;

use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use bitflags::bitflags;

use crate::config;
use crate::context::{self, EnterGuard};
use crate::coroutine::{Coroutine, State};
use crate::error::RuntimeError;
use crate::scheduler::{Core, Driver, Pool, Schedule, Task};
use crate::timer::{Timer, TimerManager};
use fd_slots::{FdSlots, Waiter};
use poller::{Poller, TicklePipe, MAX_EVENTS};

bitflags! {
    /// Readiness directions. Bit values match `EPOLLIN` / `EPOLLOUT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

pub(crate) type ReactorCore = Core<IoDriver>;

pub(crate) struct IoDriver {
    poller: Poller,
    tickle: TicklePipe,
    slots: FdSlots,
    /// Registered directions not yet triggered or removed.
    pending: AtomicUsize,
    timers: TimerManager,
    max_poll_ms: u64,
}

impl IoDriver {
    fn new() -> Result<Self, RuntimeError> {
        let poller = Poller::new()?;
        let tickle = TicklePipe::new()?;
        poller
            .add(tickle.read_fd(), Event::READ)
            .map_err(|source| RuntimeError::Register {
                fd: tickle.read_fd(),
                op: "add",
                source,
            })?;

        Ok(Self {
            poller,
            tickle,
            slots: FdSlots::with_capacity(config::initial_fd_capacity().get()),
            pending: AtomicUsize::new(0),
            timers: TimerManager::new(),
            max_poll_ms: config::max_poll_ms().get(),
        })
    }

    fn poll_timeout_ms(&self) -> i32 {
        let ms = match self.timers.next_timeout() {
            Some(ms) => ms.min(self.max_poll_ms),
            None => self.max_poll_ms,
        };
        i32::try_from(ms).unwrap_or(i32::MAX)
    }

    /// Hand readiness reported for `fd` to the registered waiters.
    fn dispatch(&self, fd: RawFd, revents: u32) {
        let Some(slot) = self.slots.get(fd) else {
            return;
        };
        let mut state = slot.state.lock();

        let mut revents = revents;
        if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events.bits();
        }
        let ready = Event::from_bits_truncate(revents) & state.events;
        if ready.is_empty() {
            return;
        }

        let remaining = state.events - ready;
        if let Err(err) = self.poller.rearm(fd, remaining) {
            tracing::error!(fd, ?remaining, error = %err, "epoll_ctl rearm failed");
            return;
        }

        for event in [Event::READ, Event::WRITE] {
            if ready.contains(event) {
                tracing::trace!(fd, ?event, "event triggered");
                state.trigger(event);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl Driver for IoDriver {
    fn tickle(&self, core: &ReactorCore) {
        if core.idle_count() == 0 {
            return;
        }
        tracing::trace!(scheduler = %core.name(), "tickle");
        self.tickle.notify();
    }

    fn stopping(&self, core: &ReactorCore) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::Acquire) == 0
            && core.base_stopping()
    }

    fn idle(&self, core: &Arc<ReactorCore>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if core.stopping() {
                // Pass the wake-up on so every blocked worker sees it.
                core.tickle();
                tracing::debug!(scheduler = %core.name(), "idle exiting");
                break;
            }

            let timeout = self.poll_timeout_ms();
            let n = match self.poller.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error = %err, "epoll_wait failed");
                    0
                }
            };

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                tracing::trace!(count = expired.len(), "timers expired");
                core.push_batch(expired.into_iter().map(|cb| Task::call(move || cb())));
            }

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                let revents = ev.events;
                if fd == self.tickle.read_fd() {
                    self.tickle.drain();
                    continue;
                }
                self.dispatch(fd, revents);
            }

            // Let the worker run what was just queued before polling again.
            Coroutine::suspend();
        }
    }

    fn enter(core: &Arc<ReactorCore>) -> EnterGuard {
        context::enter(core.clone(), Some(core.clone()))
    }
}

/// Cloneable access to a running reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    core: Arc<ReactorCore>,
}

impl ReactorHandle {
    pub(crate) fn from_core(core: Arc<ReactorCore>) -> Self {
        Self { core }
    }

    fn driver(&self) -> &IoDriver {
        &self.core.driver
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Watch `fd` for `event` (exactly one of READ or WRITE). With no
    /// callback the calling coroutine is the waiter and is expected to
    /// suspend right after.
    ///
    /// Panics if `event` is already registered for `fd`, or if no
    /// callback is given outside a running coroutine.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<(), RuntimeError> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes a single direction, got {event:?}"
        );
        let Some(slot) = self.driver().slots.get_or_grow(fd) else {
            return Err(RuntimeError::Register {
                fd,
                op: "add",
                source: std::io::Error::from_raw_os_error(libc::EBADF),
            });
        };

        let mut state = slot.state.lock();
        if state.events.intersects(event) {
            tracing::error!(fd, ?event, registered = ?state.events, "event already registered");
            panic!("{event:?} already registered for fd {fd}");
        }

        let (op, result) = if state.events.is_empty() {
            ("add", self.driver().poller.add(fd, event))
        } else {
            ("mod", self.driver().poller.modify(fd, state.events | event))
        };
        if let Err(source) = result {
            tracing::error!(fd, ?event, op, error = %source, "epoll_ctl failed");
            return Err(RuntimeError::Register { fd, op, source });
        }

        let waiter = match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let co = Coroutine::current();
                assert!(
                    !co.is_main() && co.state() == State::Exec,
                    "add_event without a callback needs a running coroutine"
                );
                Waiter::Coroutine(co)
            }
        };
        let scheduler: Arc<dyn Schedule> =
            context::current_scheduler().unwrap_or_else(|| self.core.clone() as Arc<dyn Schedule>);

        self.driver().pending.fetch_add(1, Ordering::AcqRel);
        state.events |= event;
        let ctx = state.context_mut(event);
        debug_assert!(ctx.is_empty());
        ctx.scheduler = Some(scheduler);
        ctx.waiter = Some(waiter);
        tracing::debug!(fd, ?event, "event added");
        Ok(())
    }

    /// Drop the registration without waking the waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.driver().slots.get(fd) else {
            return false;
        };
        let mut state = slot.state.lock();
        if !state.events.intersects(event) {
            return false;
        }

        let remaining = state.events - event;
        if let Err(err) = self.driver().poller.rearm(fd, remaining) {
            tracing::error!(fd, ?event, error = %err, "epoll_ctl failed in del_event");
            return false;
        }

        self.driver().pending.fetch_sub(1, Ordering::AcqRel);
        state.events = remaining;
        state.context_mut(event).reset();
        true
    }

    /// Drop the registration and schedule the waiter as if it had fired.
    ///
    /// The slot lock covers the kernel update, the enqueue and the pending
    /// count, so `stopping()` never sees the event gone before its waiter
    /// is queued.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.driver().slots.get(fd) else {
            return false;
        };
        let mut state = slot.state.lock();
        if !state.events.intersects(event) {
            return false;
        }

        let remaining = state.events - event;
        if let Err(err) = self.driver().poller.rearm(fd, remaining) {
            tracing::error!(fd, ?event, error = %err, "epoll_ctl failed in cancel_event");
            return false;
        }

        state.trigger(event);
        self.driver().pending.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(fd, ?event, "event cancelled");
        true
    }

    /// Cancel both directions of `fd`. Used before the descriptor is closed.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(slot) = self.driver().slots.get(fd) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.events.is_empty() {
            return false;
        }

        if let Err(err) = self.driver().poller.delete(fd) {
            tracing::error!(fd, error = %err, "epoll_ctl failed in cancel_all");
            return false;
        }

        for event in [Event::READ, Event::WRITE] {
            if state.events.contains(event) {
                state.trigger(event);
                self.driver().pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        debug_assert!(state.events.is_empty());
        true
    }

    /// Directions registered for `fd` right now.
    pub fn registered(&self, fd: RawFd) -> Event {
        self.driver()
            .slots
            .get(fd)
            .map_or(Event::empty(), |slot| slot.state.lock().events)
    }

    pub fn pending_events(&self) -> usize {
        self.driver().pending.load(Ordering::Acquire)
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.driver().timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.driver().timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn next_timeout(&self) -> Option<u64> {
        self.driver().timers.next_timeout()
    }

    pub fn has_timer(&self) -> bool {
        self.driver().timers.has_timer()
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Task::call(f));
    }

    pub fn schedule_on<F>(&self, f: F, thread: ThreadId)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(Task::call(f).pinned_to(thread));
    }

    pub fn schedule_coroutine(&self, co: Arc<Coroutine>) {
        self.core.push(Task::coroutine(co));
    }

    pub fn schedule_task(&self, task: Task) {
        self.core.push(task);
    }

    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.core.push_batch(tasks);
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.core.thread_ids()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.core.idle_count() > 0
    }

    pub fn stopping(&self) -> bool {
        self.core.stopping()
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("name", &self.name())
            .field("pending_events", &self.pending_events())
            .finish()
    }
}

/// An epoll-driven scheduler. Started on construction, stopped on drop.
///
/// The epoll handle and the wake pipe are released once the last
/// [`ReactorHandle`] is gone.
pub struct Reactor {
    pool: Pool<IoDriver>,
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self, RuntimeError> {
        let core = Arc::new(Core::new(name, threads, use_caller, IoDriver::new()?));

        let weak = Arc::downgrade(&core);
        core.driver.timers.set_front_listener(move || {
            if let Some(core) = weak.upgrade() {
                core.tickle();
            }
        });

        let pool = Pool::new(core.clone(), use_caller);
        pool.start()?;
        Ok(Self {
            pool,
            handle: ReactorHandle::from_core(core),
        })
    }

    /// The reactor that owns the calling worker thread.
    pub fn current() -> Option<ReactorHandle> {
        context::current_reactor().map(ReactorHandle::from_core)
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Wait for queued work, registered events and timers to drain, then
    /// join the workers.
    pub fn stop(&self) {
        self.pool.stop();
    }
}

impl Deref for Reactor {
    type Target = ReactorHandle;

    fn deref(&self) -> &ReactorHandle {
        &self.handle
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.pool.stop();
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name())
            .field("stopped", &self.pool.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    fn write_byte(fd: RawFd) {
        let n = unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "timed out waiting");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn callback_runs_when_pipe_becomes_readable() {
        let reactor = Reactor::new(2, false, "rx_cb").unwrap();
        let (rd, wr) = pipe();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        reactor
            .add_event(rd, Event::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();
        assert_eq!(reactor.registered(rd), Event::READ);
        assert_eq!(reactor.pending_events(), 1);

        write_byte(wr);
        wait_for(&fired);
        assert_eq!(reactor.registered(rd), Event::empty());
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        close(&[rd, wr]);
    }

    #[test]
    fn coroutine_waiter_is_resumed_on_readiness() {
        let reactor = Reactor::new(2, false, "rx_co").unwrap();
        let (rd, wr) = pipe();
        let got = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));

        let (g, d) = (got.clone(), done.clone());
        reactor.schedule(move || {
            let handle = Reactor::current().unwrap();
            handle.add_event(rd, Event::READ, None).unwrap();
            Coroutine::suspend();
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            g.lock().extend_from_slice(&buf[..n as usize]);
            d.store(true, Ordering::SeqCst);
        });

        // Give the coroutine time to register and park.
        let deadline = Instant::now() + Duration::from_secs(5);
        while reactor.pending_events() == 0 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        write_byte(wr);
        wait_for(&done);
        assert_eq!(*got.lock(), b"x");

        reactor.stop();
        close(&[rd, wr]);
    }

    #[test]
    fn cancel_event_schedules_waiter_without_readiness() {
        let reactor = Reactor::new(1, false, "cancel").unwrap();
        let (rd, wr) = pipe();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        reactor
            .add_event(rd, Event::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();
        assert!(reactor.cancel_event(rd, Event::READ));
        assert!(!reactor.cancel_event(rd, Event::READ));
        wait_for(&fired);
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        close(&[rd, wr]);
    }

    #[test]
    fn del_event_drops_waiter_silently() {
        let reactor = Reactor::new(1, false, "del").unwrap();
        let (rd, wr) = pipe();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        reactor
            .add_event(rd, Event::READ, Some(Box::new(move || f.store(true, Ordering::SeqCst))))
            .unwrap();
        assert!(reactor.del_event(rd, Event::READ));
        assert!(!reactor.del_event(rd, Event::READ));
        write_byte(wr);
        reactor.stop();
        assert!(!fired.load(Ordering::SeqCst));
        close(&[rd, wr]);
    }

    #[test]
    fn interest_mask_follows_add_and_cancel() {
        let reactor = Reactor::new(1, false, "mask").unwrap();
        let (rd, wr) = pipe();
        let noop = || -> Option<Box<dyn FnOnce() + Send>> { Some(Box::new(|| {})) };

        // The write end of an empty pipe is writable; use the read end for both.
        reactor.add_event(rd, Event::READ, noop()).unwrap();
        reactor.add_event(wr, Event::READ, noop()).unwrap();
        assert_eq!(reactor.registered(rd), Event::READ);
        assert_eq!(reactor.pending_events(), 2);

        assert!(reactor.cancel_all(rd));
        assert_eq!(reactor.registered(rd), Event::empty());
        assert!(!reactor.cancel_all(rd));

        assert!(reactor.cancel_event(wr, Event::READ));
        assert_eq!(reactor.registered(wr), Event::empty());
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        close(&[rd, wr]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_panics() {
        let reactor = Reactor::new(1, false, "double").unwrap();
        let (rd, _wr) = pipe();
        reactor.add_event(rd, Event::READ, Some(Box::new(|| {}))).unwrap();
        let _ = reactor.add_event(rd, Event::READ, Some(Box::new(|| {})));
    }

    #[test]
    fn bad_fd_registration_is_an_error() {
        let reactor = Reactor::new(1, false, "badfd").unwrap();
        let err = reactor
            .add_event(10_000, Event::READ, Some(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Register { op: "add", .. }));
        assert_eq!(reactor.pending_events(), 0);
        reactor.stop();
    }

    #[test]
    fn timer_fires_through_idle_loop() {
        let reactor = Reactor::new(1, false, "timer").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let start = Instant::now();
        reactor.add_timer(50, move || f.store(true, Ordering::SeqCst), false);
        wait_for(&fired);
        assert!(start.elapsed() >= Duration::from_millis(45));
        reactor.stop();
    }

    #[test]
    fn stop_waits_for_pending_timers() {
        let reactor = Reactor::new(2, false, "drain").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        reactor.add_timer(30, move || f.store(true, Ordering::SeqCst), false);
        reactor.stop();
        assert!(fired.load(Ordering::SeqCst));
        assert!(reactor.stopping());
    }

    #[test]
    fn use_caller_reactor_drains_on_stop() {
        let reactor = Reactor::new(1, true, "caller_io").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        reactor.schedule(move || f.store(true, Ordering::SeqCst));
        reactor.stop();
        assert!(fired.load(Ordering::SeqCst));
        assert!(Reactor::current().is_none());
    }
}
