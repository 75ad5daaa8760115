// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread worker context.
//!
//! One `WorkerContext` per OS thread holds everything the runtime looks up
//! implicitly: the running coroutine, the thread's main coroutine, the
//! scheduler and reactor the thread works for, and the hook-enable flag.
//! Borrows are always short; nothing is borrowed across a context switch.

use std::cell::{Cell, OnceCell, RefCell};
use std::sync::Arc;

use crate::coroutine::Coroutine;
use crate::reactor::ReactorCore;
use crate::scheduler::Schedule;

pub(crate) struct WorkerContext {
    current: RefCell<Option<Arc<Coroutine>>>,
    main: OnceCell<Arc<Coroutine>>,
    scheduler: RefCell<Option<Arc<dyn Schedule>>>,
    reactor: RefCell<Option<Arc<ReactorCore>>>,
    hook_enabled: Cell<bool>,
}

impl WorkerContext {
    const fn new() -> Self {
        Self {
            current: RefCell::new(None),
            main: OnceCell::new(),
            scheduler: RefCell::new(None),
            reactor: RefCell::new(None),
            hook_enabled: Cell::new(false),
        }
    }
}

thread_local! {
    static CONTEXT: WorkerContext = const { WorkerContext::new() };
}

/// The running non-main coroutine, if any.
pub(crate) fn current_coroutine() -> Option<Arc<Coroutine>> {
    CONTEXT.with(|cx| cx.current.borrow().clone())
}

/// Install `co` as the running coroutine, returning the previous one.
pub(crate) fn swap_current_coroutine(co: Option<Arc<Coroutine>>) -> Option<Arc<Coroutine>> {
    CONTEXT.with(|cx| std::mem::replace(&mut *cx.current.borrow_mut(), co))
}

/// This thread's main coroutine, created on first use.
pub(crate) fn thread_main() -> Arc<Coroutine> {
    CONTEXT.with(|cx| cx.main.get_or_init(Coroutine::new_main).clone())
}

pub(crate) fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    CONTEXT.with(|cx| cx.scheduler.borrow().clone())
}

pub(crate) fn current_reactor() -> Option<Arc<ReactorCore>> {
    CONTEXT.with(|cx| cx.reactor.borrow().clone())
}

pub(crate) fn hook_enabled() -> bool {
    CONTEXT.with(|cx| cx.hook_enabled.get())
}

pub(crate) fn set_hook_enabled(on: bool) {
    CONTEXT.with(|cx| cx.hook_enabled.set(on));
}

/// Bind this thread to a scheduler (and optionally its reactor) until the
/// returned guard drops, at which point the previous binding comes back.
pub(crate) fn enter(
    scheduler: Arc<dyn Schedule>,
    reactor: Option<Arc<ReactorCore>>,
) -> EnterGuard {
    CONTEXT.with(|cx| {
        let prev_scheduler = cx.scheduler.borrow_mut().replace(scheduler);
        let prev_reactor = std::mem::replace(&mut *cx.reactor.borrow_mut(), reactor);
        let prev_hook = cx.hook_enabled.replace(true);
        EnterGuard {
            scheduler: prev_scheduler,
            reactor: prev_reactor,
            hook_enabled: prev_hook,
        }
    })
}

pub(crate) struct EnterGuard {
    scheduler: Option<Arc<dyn Schedule>>,
    reactor: Option<Arc<ReactorCore>>,
    hook_enabled: bool,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let scheduler = self.scheduler.take();
        let reactor = self.reactor.take();
        let hook_enabled = self.hook_enabled;
        let _ = CONTEXT.try_with(|cx| {
            let old_scheduler = std::mem::replace(&mut *cx.scheduler.borrow_mut(), scheduler);
            let old_reactor = std::mem::replace(&mut *cx.reactor.borrow_mut(), reactor);
            cx.hook_enabled.set(hook_enabled);
            (old_scheduler, old_reactor)
        });
    }
}
