// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority preemption: a timer-woken high-priority task displaces a busy
//! low-priority loop at its next safe point.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::{Priority, Runtime, SchedKind, TaskDesc};

#[test]
fn high_priority_wakes_within_a_tick_or_so() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("preempt", vec![SchedKind::Priority])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(AtomicU64::new(0));
    let observed = Arc::new(Mutex::new(None::<(u64, u64, u64)>));

    {
        let stop = stop.clone();
        let counter = counter.clone();
        rt.spawn(TaskDesc::new("busy", Priority(1), sched), move || {
            while !stop.load(Ordering::SeqCst) {
                counter.fetch_add(1, Ordering::SeqCst);
                weft::safe_point();
            }
        })
        .unwrap();
    }

    {
        let stop = stop.clone();
        let counter = counter.clone();
        let observed = observed.clone();
        rt.spawn(TaskDesc::new("urgent", Priority(20), sched), move || {
            let rt = weft::active().unwrap();
            let deadline = rt.now() + 10;
            weft::sleep(10);
            let woke = rt.now();
            let at_wake = counter.load(Ordering::SeqCst);
            *observed.lock().unwrap() = Some((deadline, woke, at_wake));
            stop.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || {
        observed.lock().unwrap().is_some()
    }));
    let (deadline, woke, at_wake) = observed.lock().unwrap().unwrap();

    assert!(woke >= deadline, "woke {woke} before deadline {deadline}");
    assert!(
        woke - deadline <= 3,
        "wake latency {} ticks past the deadline",
        woke - deadline
    );
    // The busy loop actually ran while urgent slept.
    assert!(at_wake > 0);

    assert!(common::wait_until(Duration::from_secs(5), || {
        stop.load(Ordering::SeqCst)
    }));
    rt.shutdown();
}

#[test]
fn masked_sections_defer_preemption() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("mask", vec![SchedKind::Priority])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        rt.spawn(TaskDesc::new("masked", Priority(5), sched), move || {
            // The mask nests; preemption recorded inside only lands after
            // the outermost enable.
            weft::int_disable();
            weft::int_disable();
            for _ in 0..1_000 {
                weft::safe_point(); // no-op while masked
            }
            weft::int_enable();
            weft::int_enable();
            done.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst)
    }));
    rt.shutdown();
}
