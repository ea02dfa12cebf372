// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two tasks on one cooperative worker bouncing sequenced messages.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::{Priority, Runtime, SchedKind, TaskDesc};

const ROUNDS: u64 = 1000;

#[test]
fn ping_pong_sequences_in_order() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("pingpong", vec![SchedKind::Cooperative])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    let echo = rt
        .spawn(TaskDesc::new("echo", Priority(4), sched), move || {
            let rt = weft::active().unwrap();
            for _ in 0..ROUNDS {
                let msg = match rt.recv() {
                    Ok(m) => m,
                    Err(_) => return,
                };
                let peer = msg.sender();
                if rt.send(peer, msg).is_err() {
                    return;
                }
            }
        })
        .unwrap();

    let seqs = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));
    {
        let seqs = seqs.clone();
        let done = done.clone();
        rt.spawn(TaskDesc::new("driver", Priority(4), sched), move || {
            let rt = weft::active().unwrap();
            for i in 0..ROUNDS {
                let mut m = rt.msg_alloc().unwrap();
                m.write_as(&i).unwrap();
                rt.send(echo, m).unwrap();
                let reply = rt.recv().unwrap();
                assert_eq!(reply.sender(), echo);
                seqs.lock().unwrap().push(reply.read_as::<u64>().unwrap());
            }
            done.store(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(
        common::wait_until(Duration::from_secs(20), || done.load(Ordering::SeqCst) == 1),
        "ping-pong did not finish"
    );
    let got = seqs.lock().unwrap().clone();
    let want: Vec<u64> = (0..ROUNDS).collect();
    assert_eq!(got, want);

    rt.shutdown();
}

#[test]
fn filtered_recv_picks_matching_message() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("filter", vec![SchedKind::Cooperative])).unwrap();
    let sched = rt.scheduler(0).unwrap();

    let picked = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    let receiver = {
        let picked = picked.clone();
        let done = done.clone();
        rt.spawn(TaskDesc::new("chooser", Priority(4), sched), move || {
            let rt = weft::active().unwrap();
            // Take odd-tagged messages first, then everything else.
            for _ in 0..2 {
                let m = rt
                    .recv_filtered(
                        Some(2_000),
                        Some(&|v: weft::MsgView<'_>| v.payload[0] % 2 == 1),
                    )
                    .unwrap();
                picked.lock().unwrap().push(m.payload()[0]);
            }
            for _ in 0..2 {
                let m = rt.recv_timeout(2_000).unwrap();
                picked.lock().unwrap().push(m.payload()[0]);
            }
            done.store(1, Ordering::SeqCst);
        })
        .unwrap()
    };

    rt.spawn(TaskDesc::new("feeder", Priority(4), sched), move || {
        let rt = weft::active().unwrap();
        for tag in [2u8, 3, 4, 5] {
            let mut m = rt.msg_alloc().unwrap();
            m.write(&[tag]).unwrap();
            rt.send(receiver, m).unwrap();
        }
    })
    .unwrap();

    assert!(common::wait_until(Duration::from_secs(10), || {
        done.load(Ordering::SeqCst) == 1
    }));
    // Odd tags first (queue order preserved within each class).
    assert_eq!(*picked.lock().unwrap(), vec![3, 5, 2, 4]);

    rt.shutdown();
}
