// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker pool behaviour seen from outside the crate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_rt::{Coroutine, Scheduler, State, Task};

/// Each closure blocks its worker for this long.
const WORK: Duration = Duration::from_millis(2);

#[test]
fn every_closure_runs_exactly_once() {
    let sched = Scheduler::new(4, false, "pool");
    sched.start().unwrap();
    let start = Instant::now();

    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
    let threads = Arc::new(Mutex::new(HashSet::new()));
    for i in 0..1000 {
        let counters = counters.clone();
        let threads = threads.clone();
        sched.schedule(move || {
            counters[i].fetch_add(1, Ordering::SeqCst);
            threads.lock().insert(std::thread::current().id());
            std::thread::sleep(WORK);
        });
    }
    sched.stop();
    let elapsed = start.elapsed();

    for (i, c) in counters.iter().enumerate() {
        assert_eq!(c.load(Ordering::SeqCst), 1, "closure {i}");
    }
    let workers: HashSet<_> = sched.thread_ids().into_iter().collect();
    assert!(threads.lock().is_subset(&workers));

    // Run one after another the closures would need 2 s; four workers
    // share them.
    let serial = WORK * 1000;
    assert!(elapsed < serial * 3 / 4, "took {elapsed:?}, serial bound {serial:?}");
}

#[test]
fn batch_of_coroutines_reaches_term() {
    let sched = Scheduler::new(2, false, "batch");
    sched.start().unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let coroutines: Vec<Arc<Coroutine>> = (0..16)
        .map(|_| {
            let ran = ran.clone();
            Coroutine::new(move || {
                Coroutine::yield_now();
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    sched.schedule_batch(coroutines.iter().cloned().map(Task::coroutine));
    sched.stop();

    assert_eq!(ran.load(Ordering::SeqCst), 16);
    assert!(coroutines.iter().all(|co| co.state() == State::Term));
}

#[test]
fn caller_thread_joins_the_pool() {
    let sched = Scheduler::new(2, true, "mixed");
    sched.start().unwrap();
    assert_eq!(sched.thread_ids().len(), 2);
    assert!(sched.thread_ids().contains(&std::thread::current().id()));

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let count = count.clone();
        sched.schedule(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 100);
}
