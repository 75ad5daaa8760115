// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: stackful coroutines over a thread pool, with an epoll
//! reactor and hooked blocking calls.
//!
//! Code written against plain blocking calls (`read`, `connect`, `sleep`)
//! runs unchanged inside a coroutine: the [`hook`] layer turns a call that
//! would block into a suspension, and the [`Reactor`] resumes the
//! coroutine when the descriptor is ready or a timer fires.
//!
//! Components:
//! - coroutine: stackful execution contexts with an explicit state machine
//! - scheduler: a named pool of worker threads running coroutines and closures
//! - timer: ordered deadlines with clock-rollback handling
//! - reactor: the scheduler plus epoll readiness and timers
//! - hook: cooperative versions of blocking socket and sleep calls
//! - config: TOML-loadable tunables with change listeners
//!
//! ```no_run
//! use strand_rt::{hook, Reactor};
//!
//! let reactor = Reactor::new(2, false, "io").unwrap();
//! reactor.schedule(|| {
//!     hook::sleep(1).unwrap();
//!     println!("one second later, without blocking a worker");
//! });
//! reactor.stop();
//! ```

pub mod config;
pub(crate) mod context;
pub mod coroutine;
pub mod error;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod timer;

pub use config::{ConfigVar, RuntimeConfig};
pub use coroutine::{Coroutine, State};
pub use error::{ConfigError, RuntimeError};
pub use reactor::{Event, Reactor, ReactorHandle};
pub use scheduler::{spawn, Job, Scheduler, Task};
pub use timer::{Clock, ManualClock, SystemClock, Timer, TimerManager};
