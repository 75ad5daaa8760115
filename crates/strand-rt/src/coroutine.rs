// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful coroutines.
//!
//! Each coroutine owns a stack and a saved execution context (a `generator`
//! stackful generator). `resume` switches from the calling context into the
//! coroutine; `suspend`/`yield_now` switch back to whoever resumed it. At
//! most one coroutine is `Exec` per thread at a time.
//!
//! Every thread also has a main coroutine (id 0) standing for the thread's
//! own stack. It never owns an entry closure or a stack and is always `Exec`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use generator::{Generator, Gn};
use parking_lot::Mutex;

use crate::config;
use crate::context;

/// Coroutine lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created or reset, never resumed since.
    Init = 0,
    /// Suspended; someone else owns re-scheduling it.
    Hold = 1,
    /// Currently running on some thread.
    Exec = 2,
    /// Yielded and wants to be re-queued.
    Ready = 3,
    /// Entry returned.
    Term = 4,
    /// Entry panicked.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Hold,
            2 => Self::Exec,
            3 => Self::Ready,
            4 => Self::Term,
            _ => Self::Except,
        }
    }

    /// `Init`, `Term` and `Except`: the stack is idle and may be freed or reused.
    pub fn is_reusable(self) -> bool {
        matches!(self, State::Init | State::Term | State::Except)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

pub type Entry = Box<dyn FnOnce() + Send + 'static>;

type Context = Generator<'static, (), ()>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE: AtomicU64 = AtomicU64::new(0);

pub struct Coroutine {
    id: u64,
    state: AtomicU8,
    stack_size: usize,
    /// `None` only for a thread's main coroutine.
    context: Mutex<Option<Context>>,
}

impl Coroutine {
    /// Create a coroutine with the configured default stack size.
    pub fn new<F>(entry: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(entry, config::stack_size().get())
    }

    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        LIVE.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(coroutine = id, stack_size, "coroutine created");
        Arc::new(Self {
            id,
            state: AtomicU8::new(State::Init as u8),
            stack_size,
            context: Mutex::new(Some(build_context(stack_size, Box::new(entry)))),
        })
    }

    pub(crate) fn new_main() -> Arc<Self> {
        LIVE.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("main coroutine created");
        Arc::new(Self {
            id: 0,
            state: AtomicU8::new(State::Exec as u8),
            stack_size: 0,
            context: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn is_main(&self) -> bool {
        self.id == 0
    }

    /// Switch into this coroutine until it suspends, yields or finishes.
    /// Returns the state it left in.
    ///
    /// Panics if the coroutine is already executing or is a main coroutine.
    pub fn resume(self: &Arc<Self>) -> State {
        let mut slot = self.context.lock();
        let Some(ctx) = slot.as_mut() else {
            panic!("cannot resume the main coroutine of a thread");
        };

        let prev = self.state();
        if prev.is_finished() {
            return prev;
        }
        if prev == State::Exec {
            tracing::error!(coroutine = self.id, "resume of an executing coroutine");
            panic!("coroutine {} resumed while already executing", self.id);
        }
        self.set_state(State::Exec);

        let outer = context::swap_current_coroutine(Some(self.clone()));
        ctx.resume();
        context::swap_current_coroutine(outer);

        // Observed under the context lock: this is the state at switch-out,
        // before any other thread can resume it again.
        self.state()
    }

    /// Replace the entry of a finished (or never started) coroutine, reusing
    /// its stack size. Panics unless the state is `Init`, `Term` or `Except`.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.context.lock();
        assert!(slot.is_some(), "cannot reset the main coroutine of a thread");
        let state = self.state();
        assert!(
            state.is_reusable(),
            "coroutine {} reset while {:?}",
            self.id,
            state
        );
        *slot = Some(build_context(self.stack_size, Box::new(entry)));
        self.set_state(State::Init);
    }

    /// The running coroutine, or this thread's main coroutine outside one.
    pub fn current() -> Arc<Coroutine> {
        context::current_coroutine().unwrap_or_else(context::thread_main)
    }

    /// Id of the running coroutine; 0 outside a coroutine.
    pub fn current_id() -> u64 {
        context::current_coroutine().map_or(0, |co| co.id)
    }

    /// True when called from inside a non-main coroutine.
    pub fn in_coroutine() -> bool {
        context::current_coroutine().is_some()
    }

    /// Exec -> Hold: give control back to the resumer. Whoever holds a
    /// reference is responsible for scheduling the coroutine again.
    pub fn suspend() {
        Self::switch_out(State::Hold);
    }

    /// Exec -> Ready: give control back and ask to be re-queued.
    pub fn yield_now() {
        Self::switch_out(State::Ready);
    }

    fn switch_out(to: State) {
        let Some(cur) = context::current_coroutine() else {
            panic!("suspend called outside of a coroutine");
        };
        assert_eq!(
            cur.state(),
            State::Exec,
            "coroutine {} switching out while not executing",
            cur.id
        );
        cur.set_state(to);
        drop(cur);
        // Suspension happens deep inside hooked calls where no generator
        // `Scope` is reachable; the unscoped yield finds the running
        // generator through its own thread-local context.
        #[allow(deprecated)]
        generator::yield_with(());
    }

    /// Number of coroutine objects alive in the process, main ones included.
    pub fn live_count() -> u64 {
        LIVE.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::Relaxed);
        if self.is_main() {
            tracing::trace!("main coroutine dropped");
            return;
        }
        let state = self.state();
        if !state.is_reusable() && !std::thread::panicking() {
            tracing::error!(coroutine = self.id, ?state, "coroutine dropped while live");
            panic!("coroutine {} dropped in state {:?}", self.id, state);
        }
    }
}

fn build_context(stack_size: usize, entry: Entry) -> Context {
    // `generator` sizes stacks in machine words; keep the count even.
    let words = (stack_size / std::mem::size_of::<usize>()) & !1;
    Gn::<()>::new_opt(words, move || run_entry(entry))
}

/// Body of every coroutine: run the entry, record how it ended.
fn run_entry(entry: Entry) {
    let result = panic::catch_unwind(AssertUnwindSafe(entry));

    // Generator teardown unwinds through us; let it through.
    if let Err(payload) = result {
        if payload.is::<generator::Error>() {
            panic::resume_unwind(payload);
        }
        return record_panic(payload);
    }
    if let Some(cur) = context::current_coroutine() {
        cur.set_state(State::Term);
    }
}

fn record_panic(payload: Box<dyn Any + Send>) {
    if let Some(cur) = context::current_coroutine() {
        cur.set_state(State::Except);
        tracing::error!(
            coroutine = cur.id,
            panic = %panic_message(&*payload),
            "coroutine panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
