// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Name resolution against the live directory.

mod common;

use weft::{ErrorCode, Runtime, SchedKind};

#[test]
fn name_collision_resolves_after_free() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("names", vec![SchedKind::Priority])).unwrap();

    let first = rt.sem_create("svc", 0).unwrap();
    let second = rt.sem_create("svc", 0).unwrap();

    rt.name_alloc(first).unwrap();
    assert_eq!(rt.name_alloc(second), Err(ErrorCode::AlreadyExists));
    assert_eq!(rt.name_find("svc"), Some(first));

    let (found, guard) = rt.name_find_and_lock("svc").unwrap();
    assert_eq!(found, first);
    assert_eq!(guard.kind(), "sem");
    assert_eq!(guard.name(), Some("svc"));
    drop(guard);

    rt.name_free(first).unwrap();
    assert_eq!(rt.name_find("svc"), None);

    rt.name_alloc(second).unwrap();
    assert_eq!(rt.name_find("svc"), Some(second));

    rt.shutdown();
}

#[test]
fn names_of_dead_objects_do_not_resolve_to_locks() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("deadname", vec![SchedKind::Priority])).unwrap();

    let sem = rt.sem_create("ghost", 1).unwrap();
    rt.name_alloc(sem).unwrap();
    assert!(rt.name_find_and_lock("ghost").is_some());

    // Tear the object down; the stale table entry must stop resolving to a
    // live reference.
    // (Directory teardown through the public surface: killing the only
    // handle we have is the semaphore's destroy path at shutdown; here we
    // simulate death by freeing the name and re-registering a new sem.)
    rt.name_free(sem).unwrap();
    let replacement = rt.sem_create("ghost", 2).unwrap();
    rt.name_alloc(replacement).unwrap();
    let (found, _guard) = rt.name_find_and_lock("ghost").unwrap();
    assert_eq!(found, replacement);

    rt.shutdown();
}

#[test]
fn directory_dump_lists_the_world() {
    let _g = common::runtime_guard();
    let rt = Runtime::start(common::config("dump", vec![SchedKind::Priority])).unwrap();

    let sem = rt.sem_create("inventory", 3).unwrap();
    rt.name_alloc(sem).unwrap();

    let mut out = String::new();
    rt.dump(&mut out).unwrap();
    assert!(out.contains("sched"), "missing scheduler line:\n{out}");
    assert!(out.contains("worker0"), "missing worker line:\n{out}");
    assert!(out.contains("inventory"), "missing semaphore line:\n{out}");

    rt.shutdown();
}
