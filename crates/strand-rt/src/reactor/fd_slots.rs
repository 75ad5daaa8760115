// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-descriptor event registrations.
//!
//! Slots live in an arena indexed by fd number. The arena only grows, so
//! a slot handed out stays valid for the life of the reactor.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::Event;
use crate::coroutine::Coroutine;
use crate::scheduler::{Schedule, Task};

/// What to wake when a direction becomes ready.
pub(crate) enum Waiter {
    Coroutine(Arc<Coroutine>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

#[derive(Default)]
pub(crate) struct EventContext {
    pub scheduler: Option<Arc<dyn Schedule>>,
    pub waiter: Option<Waiter>,
}

impl EventContext {
    pub fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.waiter.is_none()
    }

    pub fn reset(&mut self) {
        self.scheduler = None;
        self.waiter = None;
    }
}

#[derive(Default)]
pub(crate) struct FdEvents {
    /// Directions currently registered with the kernel.
    pub events: Event,
    pub read: EventContext,
    pub write: EventContext,
}

impl FdEvents {
    pub fn context_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("no event context for {event:?}");
        }
    }

    /// Clear `event` and hand its waiter to the scheduler it came from.
    /// Never resumes anything inline.
    pub fn trigger(&mut self, event: Event) {
        assert!(
            self.events.contains(event),
            "trigger of unregistered {event:?}"
        );
        self.events.remove(event);
        let ctx = self.context_mut(event);
        let scheduler = ctx.scheduler.take();
        let waiter = ctx.waiter.take();
        let (Some(scheduler), Some(waiter)) = (scheduler, waiter) else {
            return;
        };
        let task = match waiter {
            Waiter::Coroutine(co) => Task::coroutine(co),
            Waiter::Callback(cb) => Task::call(cb),
        };
        scheduler.schedule_task(task);
    }
}

pub(crate) struct FdSlot {
    pub state: Mutex<FdEvents>,
}

impl FdSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FdEvents::default()),
        })
    }
}

pub(crate) struct FdSlots {
    slots: RwLock<Vec<Arc<FdSlot>>>,
}

impl FdSlots {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: RwLock::new((0..capacity).map(|_| FdSlot::new()).collect()),
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let idx = usize::try_from(fd).ok()?;
        self.slots.read().get(idx).cloned()
    }

    /// The slot for `fd`, doubling the arena until it fits.
    pub fn get_or_grow(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let idx = usize::try_from(fd).ok()?;
        if let Some(slot) = self.slots.read().get(idx) {
            return Some(slot.clone());
        }

        let mut slots = self.slots.write();
        let mut len = slots.len().max(1);
        while len <= idx {
            len *= 2;
        }
        let start = slots.len();
        slots.extend((start..len).map(|_| FdSlot::new()));
        tracing::debug!(capacity = len, "fd slot arena grown");
        slots.get(idx).cloned()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        tasks: Mutex<Vec<Task>>,
    }

    impl Schedule for Recorder {
        fn schedule_task(&self, task: Task) {
            self.tasks.lock().push(task);
        }
    }

    fn register(events: &mut FdEvents, event: Event, sched: &Arc<Recorder>) {
        assert!(!events.events.intersects(event));
        events.events |= event;
        let ctx = events.context_mut(event);
        ctx.scheduler = Some(sched.clone());
        ctx.waiter = Some(Waiter::Callback(Box::new(|| {})));
    }

    #[test]
    fn arena_doubles_until_fd_fits() {
        let slots = FdSlots::with_capacity(64);
        assert_eq!(slots.capacity(), 64);
        assert!(slots.get(64).is_none());

        let slot = slots.get_or_grow(200).unwrap();
        assert_eq!(slots.capacity(), 256);
        assert!(Arc::ptr_eq(&slot, &slots.get(200).unwrap()));
        assert!(slots.get_or_grow(-1).is_none());
    }

    #[test]
    fn grown_arena_keeps_existing_slots() {
        let slots = FdSlots::with_capacity(4);
        let before = slots.get(3).unwrap();
        slots.get_or_grow(9).unwrap();
        assert!(Arc::ptr_eq(&before, &slots.get(3).unwrap()));
    }

    #[test]
    fn trigger_schedules_and_clears_direction() {
        let sched = Arc::new(Recorder::default());
        let mut events = FdEvents::default();
        register(&mut events, Event::READ, &sched);
        register(&mut events, Event::WRITE, &sched);

        events.trigger(Event::READ);
        assert_eq!(events.events, Event::WRITE);
        assert!(events.read.is_empty());
        assert!(!events.write.is_empty());
        assert_eq!(sched.tasks.lock().len(), 1);
    }

    #[test]
    fn interest_mask_tracks_net_effect() {
        let sched = Arc::new(Recorder::default());
        let mut events = FdEvents::default();
        let mut expected = Event::empty();

        let steps: [(bool, Event); 8] = [
            (true, Event::READ),
            (true, Event::WRITE),
            (false, Event::READ),
            (true, Event::READ),
            (false, Event::WRITE),
            (false, Event::READ),
            (true, Event::WRITE),
            (false, Event::WRITE),
        ];
        for (add, event) in steps {
            if add {
                register(&mut events, event, &sched);
                expected |= event;
            } else {
                events.trigger(event);
                expected.remove(event);
            }
            assert_eq!(events.events, expected);
        }
        assert_eq!(sched.tasks.lock().len(), 4);
    }

    #[test]
    #[should_panic(expected = "unregistered")]
    fn trigger_without_registration_panics() {
        FdEvents::default().trigger(Event::WRITE);
    }
}
