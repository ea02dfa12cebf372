// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The exception chain end to end: panicking tasks, stack overflows, user
//! raises, and cooperative kills -- with the rest of the system unharmed.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::{Disposition, ExceptionType, Priority, Runtime, SchedKind, TaskDesc};

#[test]
fn divide_by_zero_kills_only_the_offender() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("divzero", vec![SchedKind::Priority])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    rt.spawn(TaskDesc::new("offender", Priority(4), sched), || {
        let z = std::hint::black_box(0u64);
        let _ = std::hint::black_box(1u64 / z);
        unreachable!();
    })
    .unwrap();

    let survivor_done = Arc::new(AtomicU64::new(0));
    {
        let survivor_done = survivor_done.clone();
        rt.spawn(TaskDesc::new("survivor", Priority(4), sched), move || {
            let mut acc = 0u64;
            for i in 0..100 {
                acc += i;
                weft::yield_now();
            }
            survivor_done.store(acc, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || {
        survivor_done.load(Ordering::SeqCst) != 0
    }));
    assert_eq!(survivor_done.load(Ordering::SeqCst), 4950);

    // The offender is gone from the directory.
    assert!(common::wait_until(Duration::from_secs(5), || {
        let mut out = String::new();
        rt.dump(&mut out).unwrap();
        !out.contains("offender")
    }));

    rt.shutdown();
}

#[test]
fn stack_overflow_hits_the_guard_and_kills_the_task() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("overflow", vec![SchedKind::Priority])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    fn burn(n: u64) -> u64 {
        let pad = [0u8; 4096];
        std::hint::black_box(&pad);
        if n == 0 {
            0
        } else {
            burn(n - 1) + 1
        }
    }

    rt.spawn(TaskDesc::new("deep", Priority(4), sched), || {
        let _ = std::hint::black_box(burn(1_000_000));
    })
    .unwrap();

    let alive = Arc::new(AtomicBool::new(false));
    {
        let alive = alive.clone();
        rt.spawn(TaskDesc::new("bystander", Priority(4), sched), move || {
            weft::sleep(20);
            alive.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(10), || {
        alive.load(Ordering::SeqCst)
    }));
    assert!(common::wait_until(Duration::from_secs(10), || {
        let mut out = String::new();
        rt.dump(&mut out).unwrap();
        !out.contains("deep")
    }));

    rt.shutdown();
}

#[test]
fn user_raise_walks_the_chain_in_order() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("raise", vec![SchedKind::Priority])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    static FORWARDED: AtomicBool = AtomicBool::new(false);
    static CLAIMED: AtomicBool = AtomicBool::new(false);

    FORWARDED.store(false, Ordering::SeqCst);
    CLAIMED.store(false, Ordering::SeqCst);

    rt.register_exception_handler(|info| {
        if matches!(info.ty, ExceptionType::User(_)) {
            FORWARDED.store(true, Ordering::SeqCst);
        }
        Disposition::Forward
    })
    .unwrap();
    rt.register_exception_handler(|info| match info.ty {
        ExceptionType::User(42) => {
            CLAIMED.store(true, Ordering::SeqCst);
            Disposition::Continue
        }
        _ => Disposition::Forward,
    })
    .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        rt.spawn(TaskDesc::new("raiser", Priority(4), sched), move || {
            let rt = weft::active().unwrap();
            rt.raise(ExceptionType::User(42), 7);
            // Continue disposition: still alive.
            done.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst)
    }));
    assert!(FORWARDED.load(Ordering::SeqCst), "first handler not visited");
    assert!(CLAIMED.load(Ordering::SeqCst), "second handler not visited");

    rt.shutdown();
}

#[test]
fn killing_a_blocked_task_runs_its_destructors() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("kill", vec![SchedKind::Priority])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let dropped = Arc::new(AtomicBool::new(false));
    let victim = {
        let dropped = dropped.clone();
        rt.spawn(TaskDesc::new("victim", Priority(4), sched), move || {
            let _guard = DropFlag(dropped);
            let rt = weft::active().unwrap();
            // Blocks forever; only the kill can end this.
            let _ = rt.recv();
            unreachable!("recv returned on a queue nobody sends to");
        })
        .unwrap()
    };

    // Let it reach the blocked state, then kill it.
    std::thread::sleep(Duration::from_millis(50));
    rt.kill_task(victim).unwrap();

    assert!(
        common::wait_until(Duration::from_secs(5), || dropped.load(Ordering::SeqCst)),
        "victim's locals were not dropped"
    );
    assert!(common::wait_until(Duration::from_secs(5), || {
        let mut out = String::new();
        rt.dump(&mut out).unwrap();
        !out.contains("victim")
    }));

    rt.shutdown();
}
