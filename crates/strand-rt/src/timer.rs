// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline timers.
//!
//! A [`TimerManager`] keeps timers ordered by `(fire time, id)` so several
//! timers may share a millisecond. The reactor asks it how long it may
//! block (`next_timeout`) and collects due callbacks after every wait
//! (`list_expired`). Callbacks are always run by the caller, outside the
//! manager's lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Millisecond time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch. Follows system time
/// changes, including backward jumps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct Entry {
    next: u64,
    period: u64,
    recurring: bool,
    callback: Callback,
}

#[derive(Default)]
struct TimerState {
    order: BTreeSet<(u64, u64)>,
    entries: HashMap<u64, Entry>,
    previous_ms: u64,
}

struct TimerShared {
    clock: Arc<dyn Clock>,
    state: RwLock<TimerState>,
    next_id: AtomicU64,
    /// Set after a front-insert notification until `next_timeout` runs.
    tickled: AtomicBool,
    on_front: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerShared {
    /// Insert under the write lock. Returns whether the owner should be
    /// told about a new earliest deadline.
    fn insert(&self, state: &mut TimerState, id: u64, entry: Entry) -> bool {
        let key = (entry.next, id);
        state.order.insert(key);
        state.entries.insert(id, entry);
        let at_front = state.order.first() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(cb) = self.on_front.read().as_ref() {
            cb();
        }
    }
}

/// Ordered registry of deadline callbacks.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let previous_ms = clock.now_ms();
        Self {
            shared: Arc::new(TimerShared {
                clock,
                state: RwLock::new(TimerState {
                    previous_ms,
                    ..TimerState::default()
                }),
                next_id: AtomicU64::new(1),
                tickled: AtomicBool::new(false),
                on_front: RwLock::new(None),
            }),
        }
    }

    /// Called, outside the lock, when a new timer becomes the earliest one.
    pub fn set_front_listener<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_front.write() = Some(Box::new(f));
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Fire `cb` after `ms` milliseconds, and every `ms` after that if
    /// `recurring`.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_callback(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs while `cond`
    /// can still be upgraded.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_callback(&self, ms: u64, callback: Callback, recurring: bool) -> Timer {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            next: shared.clock.now_ms().saturating_add(ms),
            period: ms,
            recurring,
            callback,
        };
        let notify = {
            let mut state = shared.state.write();
            shared.insert(&mut state, id, entry)
        };
        if notify {
            shared.notify_front();
        }
        tracing::trace!(timer = id, ms, recurring, "timer added");
        Timer {
            id,
            shared: Arc::downgrade(shared),
        }
    }

    /// Milliseconds until the earliest timer is due, 0 if one is overdue,
    /// `None` if no timer is pending. Re-arms front-insert notification.
    pub fn next_timeout(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let state = self.shared.state.read();
        let &(next, _) = state.order.first()?;
        let now = self.shared.clock.now_ms();
        Some(next.saturating_sub(now))
    }

    /// Remove and return the callbacks of every due timer. Recurring timers
    /// are rescheduled from now. If the clock moved backwards since the
    /// last call, every pending timer is treated as due.
    pub fn list_expired(&self) -> Vec<Callback> {
        let now = self.shared.clock.now_ms();
        if self.shared.state.read().order.is_empty() {
            return Vec::new();
        }

        let mut state = self.shared.state.write();
        let rollback = now < state.previous_ms;
        if rollback {
            tracing::warn!(
                previous_ms = state.previous_ms,
                now_ms = now,
                "clock moved backwards, firing all pending timers"
            );
        }
        state.previous_ms = now;

        let due: Vec<(u64, u64)> = if rollback {
            state.order.iter().copied().collect()
        } else {
            state.order.range(..=(now, u64::MAX)).copied().collect()
        };

        let mut callbacks = Vec::with_capacity(due.len());
        for key in due {
            state.order.remove(&key);
            let id = key.1;
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            callbacks.push(entry.callback.clone());
            if entry.recurring {
                entry.next = now.saturating_add(entry.period);
                let next = entry.next;
                state.order.insert((next, id));
            } else {
                state.entries.remove(&id);
            }
        }
        callbacks
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.len())
            .finish()
    }
}

/// Handle to a registered timer. Outliving the manager is harmless: every
/// operation then reports failure.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    shared: Weak<TimerShared>,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unregister. False if the timer already fired (one-shot) or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.write();
        match state.entries.remove(&self.id) {
            Some(entry) => {
                state.order.remove(&(entry.next, self.id));
                true
            }
            None => false,
        }
    }

    /// Push the deadline out to one full period from now.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let now = shared.clock.now_ms();
        let mut state = shared.state.write();
        let Some(entry) = state.entries.get_mut(&self.id) else {
            return false;
        };
        let old = entry.next;
        entry.next = now.saturating_add(entry.period);
        let new = entry.next;
        state.order.remove(&(old, self.id));
        state.order.insert((new, self.id));
        true
    }

    /// Change the period to `ms`, counting from now or from the timer's
    /// original start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let notify = {
            let mut state = shared.state.write();
            let Some(entry) = state.entries.get(&self.id) else {
                return false;
            };
            if ms == entry.period && !from_now {
                return true;
            }
            let mut entry = match state.entries.remove(&self.id) {
                Some(entry) => entry,
                None => return false,
            };
            state.order.remove(&(entry.next, self.id));
            let start = if from_now {
                shared.clock.now_ms()
            } else {
                entry.next.saturating_sub(entry.period)
            };
            entry.period = ms;
            entry.next = start.saturating_add(ms);
            shared.insert(&mut state, self.id, entry)
        };
        if notify {
            shared.notify_front();
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.state.read().entries.contains_key(&self.id))
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const T0: u64 = 10_000_000;

    fn manual() -> (Arc<ManualClock>, TimerManager) {
        let clock = Arc::new(ManualClock::new(T0));
        let mgr = TimerManager::with_clock(clock.clone());
        (clock, mgr)
    }

    fn fire(mgr: &TimerManager) -> usize {
        let cbs = mgr.list_expired();
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn fires_in_deadline_order() {
        let (clock, mgr) = manual();
        let order = Arc::new(Mutex::new(Vec::new()));
        for delay in [50u64, 10, 30] {
            let o = order.clone();
            mgr.add_timer(delay, move || o.lock().push(delay), false);
        }

        clock.advance(10);
        assert_eq!(fire(&mgr), 1);
        assert_eq!(*order.lock(), vec![10]);

        clock.advance(50);
        assert_eq!(fire(&mgr), 2);
        assert_eq!(*order.lock(), vec![10, 30, 50]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn same_millisecond_timers_keep_insertion_order() {
        let (clock, mgr) = manual();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5 {
            let o = order.clone();
            mgr.add_timer(20, move || o.lock().push(tag), false);
        }
        clock.advance(20);
        fire(&mgr);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_is_single_shot() {
        let (clock, mgr) = manual();
        let t = mgr.add_timer(10, || {}, false);
        assert!(t.is_pending());
        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(!t.is_pending());

        let fired = mgr.add_timer(5, || {}, false);
        clock.advance(5);
        assert_eq!(fire(&mgr), 1);
        assert!(!fired.cancel());
        assert!(!fired.refresh());
        assert!(!fired.reset(100, true));
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn next_timeout_reports_remaining_time() {
        let (clock, mgr) = manual();
        assert_eq!(mgr.next_timeout(), None);
        mgr.add_timer(100, || {}, false);
        assert_eq!(mgr.next_timeout(), Some(100));
        clock.advance(40);
        assert_eq!(mgr.next_timeout(), Some(60));
        clock.advance(100);
        assert_eq!(mgr.next_timeout(), Some(0));
    }

    #[test]
    fn recurring_timer_reschedules_from_now() {
        let (clock, mgr) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        for _ in 0..3 {
            clock.advance(10);
            fire(&mgr);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.next_timeout(), Some(10));
        assert!(t.cancel());
        clock.advance(10);
        assert_eq!(fire(&mgr), 0);
    }

    #[test]
    fn backward_jump_fires_each_timer_once() {
        let (clock, mgr) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        for delay in [1_000u64, 5_000, 60_000] {
            let h = hits.clone();
            mgr.add_timer(
                delay,
                move || {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                false,
            );
        }

        clock.set(T0 - 60 * 60 * 1000);
        assert_eq!(fire(&mgr), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        clock.advance(2 * 60 * 60 * 1000);
        assert_eq!(fire(&mgr), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn refresh_and_reset_move_the_deadline() {
        let (clock, mgr) = manual();
        let t = mgr.add_timer(100, || {}, false);

        clock.advance(60);
        assert!(t.refresh());
        assert_eq!(mgr.next_timeout(), Some(100));

        // Same period, not from now: nothing to do.
        assert!(t.reset(100, false));
        assert_eq!(mgr.next_timeout(), Some(100));

        // Shorter period measured from the original start (T0 + 60).
        clock.advance(10);
        assert!(t.reset(30, false));
        assert_eq!(mgr.next_timeout(), Some(20));

        assert!(t.reset(500, true));
        assert_eq!(mgr.next_timeout(), Some(500));
    }

    #[test]
    fn condition_timer_needs_live_guard() {
        let (clock, mgr) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let alive = Arc::new(());
        let dead = Arc::new(());

        let h = hits.clone();
        mgr.add_condition_timer(
            5,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&alive),
            false,
        );
        let h = hits.clone();
        mgr.add_condition_timer(
            5,
            move || {
                h.fetch_add(100, Ordering::SeqCst);
            },
            Arc::downgrade(&dead),
            false,
        );
        drop(dead);

        clock.advance(5);
        assert_eq!(fire(&mgr), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_insert_notifies_once_until_rearmed() {
        let (_clock, mgr) = manual();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        mgr.set_front_listener(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });

        mgr.add_timer(100, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Earlier again, but not re-armed yet.
        mgr.add_timer(50, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        mgr.next_timeout();
        mgr.add_timer(200, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        mgr.add_timer(10, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handles_outliving_manager_fail_quietly() {
        let (_clock, mgr) = manual();
        let t = mgr.add_timer(10, || {}, false);
        drop(mgr);
        assert!(!t.cancel());
        assert!(!t.is_pending());
    }
}
