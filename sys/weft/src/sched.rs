// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Schedulers.
//!
//! A scheduler is a policy object owning the ready bookkeeping for the
//! tasks assigned to it, bound to exactly one worker. The policy interface
//! is deliberately small:
//!
//! - `get_next` runs on the owning worker with interrupts disabled and must
//!   not allocate;
//! - `ready` may be called from any thread; a task made ready before
//!   `get_next` observes the previous run is reflected by the next call
//!   (the run-queue lock gives us that ordering);
//! - `block` is called by the blocking task on its own worker before it
//!   switches away. Queue-based policies have nothing to remove -- a
//!   running task is not enqueued -- so this is bookkeeping only, and a
//!   racing `ready` that lands between `block` and the context switch is
//!   preserved rather than lost.
//!
//! Two policies are provided: a cooperative FIFO and a 32-level priority
//! bitmap with round-robin inside each level.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;

use abi::{ErrorCode, ObjectId, Priority};

use crate::config::TIMESLICE_TICKS;
use crate::startup::Runtime;
use crate::worker;

/// Which policy a worker runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedKind {
    /// FIFO over ready tasks; tasks run until they yield or block.
    Cooperative,
    /// Fixed-priority with round-robin per level; a task made ready at a
    /// higher priority than the running one preempts it at the next safe
    /// point.
    Priority,
}

pub(crate) trait SchedPolicy: Send + Sync {
    fn add(&self, task: ObjectId, pri: Priority);
    fn remove(&self, task: ObjectId);
    /// Enqueues a runnable task. Returns true if the caller should consider
    /// preempting the owning worker's current task.
    fn ready(&self, task: ObjectId, pri: Priority) -> bool;
    fn block(&self, task: ObjectId);
    fn get_next(&self) -> Option<ObjectId>;
    /// Periodic hook from the clock thread. Returns true if the worker
    /// should be asked to reschedule.
    fn tick(&self, now: u64) -> bool;
}

/// Directory object wrapping a policy and its worker binding.
pub(crate) struct SchedObj {
    name: String,
    kind: SchedKind,
    worker: AtomicUsize,
    policy: Box<dyn SchedPolicy>,
}

impl SchedObj {
    pub(crate) fn new(name: String, kind: SchedKind, worker_index: usize) -> SchedObj {
        let policy: Box<dyn SchedPolicy> = match kind {
            SchedKind::Cooperative => Box::new(Fifo::new()),
            SchedKind::Priority => Box::new(PriorityRr::new()),
        };
        SchedObj {
            name,
            kind,
            worker: AtomicUsize::new(worker_index),
            policy,
        }
    }

    pub(crate) fn worker_index(&self) -> usize {
        self.worker.load(Ordering::Relaxed)
    }

    pub(crate) fn kind(&self) -> SchedKind {
        self.kind
    }
}

impl crate::dir::Object for SchedObj {
    fn kind(&self) -> &'static str {
        "sched"
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            out,
            "{} {:?} worker={}",
            self.name,
            self.kind,
            self.worker_index()
        )
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

/// Adds a task to a scheduler's set (at spawn).
pub(crate) fn add(rt: &Runtime, sched: ObjectId, task: ObjectId, pri: Priority) -> Result<(), ErrorCode> {
    let Some(s) = rt.dir().find_as::<SchedObj>(sched) else {
        return Err(ErrorCode::NotFound);
    };
    s.policy.add(task, pri);
    Ok(())
}

/// Removes a task from a scheduler's set (at reap).
pub(crate) fn remove(rt: &Runtime, sched: ObjectId, task: ObjectId) {
    if let Some(s) = rt.dir().find_as::<SchedObj>(sched) {
        s.policy.remove(task);
    }
}

/// Marks a task runnable and pokes the owning worker: always an unpark (it
/// may be idle), plus a preemption interrupt when the policy asks for one
/// and the worker is currently running something less important.
pub(crate) fn ready(rt: &Runtime, sched: ObjectId, task: ObjectId, pri: Priority) {
    let Some(s) = rt.dir().find_as::<SchedObj>(sched) else {
        return;
    };
    let wants_preempt = s.policy.ready(task, pri);
    let w = s.worker_index();
    worker::wake(w);
    if wants_preempt {
        if let Some(current_pri) = worker::current_priority(w) {
            if pri.is_more_important_than(current_pri)
                && worker::current_index() != Some(w)
            {
                worker::interrupt(w);
            }
        }
    }
}

pub(crate) fn block(rt: &Runtime, sched: ObjectId, task: ObjectId) {
    if let Some(s) = rt.dir().find_as::<SchedObj>(sched) {
        s.policy.block(task);
    }
}

pub(crate) fn get_next(rt: &Runtime, sched: ObjectId) -> Option<ObjectId> {
    rt.dir().find_as::<SchedObj>(sched)?.policy.get_next()
}

/// Sends the preemption signal to the worker owning `sched`.
pub(crate) fn interrupt_worker(rt: &Runtime, sched: ObjectId) {
    if let Some(s) = rt.dir().find_as::<SchedObj>(sched) {
        worker::interrupt(s.worker_index());
    }
}

/// Clock-thread hook: runs every scheduler's tick and interrupts workers
/// that should reschedule.
pub(crate) fn tick_all(rt: &Runtime, now: u64) {
    for sched in rt.scheduler_ids() {
        if let Some(s) = rt.dir().find_as::<SchedObj>(*sched) {
            if s.policy.tick(now) {
                worker::interrupt(s.worker_index());
                worker::wake(s.worker_index());
            }
        }
    }
}

/// Cooperative FIFO.
struct Fifo {
    q: spin::Mutex<VecDeque<ObjectId>>,
}

impl Fifo {
    fn new() -> Self {
        Fifo {
            q: spin::Mutex::new(VecDeque::with_capacity(32)),
        }
    }
}

impl SchedPolicy for Fifo {
    fn add(&self, _task: ObjectId, _pri: Priority) {}

    fn remove(&self, task: ObjectId) {
        self.q.lock().retain(|t| *t != task);
    }

    fn ready(&self, task: ObjectId, _pri: Priority) -> bool {
        self.q.lock().push_back(task);
        false
    }

    fn block(&self, _task: ObjectId) {}

    fn get_next(&self) -> Option<ObjectId> {
        self.q.lock().pop_front()
    }

    fn tick(&self, _now: u64) -> bool {
        false
    }
}

/// Fixed-priority, round-robin within a level. A set bit in `bitmap` means
/// the corresponding level has queued tasks; selection is the highest set
/// bit, so it stays O(1) regardless of how many tasks are parked below.
struct PriorityRr {
    inner: spin::Mutex<PrioInner>,
}

struct PrioInner {
    bitmap: u32,
    levels: [VecDeque<ObjectId>; 32],
    /// Tick at which the current run began; drives same-level round-robin.
    slice_start: u64,
    running_pri: Option<Priority>,
}

impl PriorityRr {
    fn new() -> Self {
        PriorityRr {
            inner: spin::Mutex::new(PrioInner {
                bitmap: 0,
                levels: core::array::from_fn(|_| VecDeque::with_capacity(8)),
                slice_start: 0,
                running_pri: None,
            }),
        }
    }
}

impl PrioInner {
    fn top_level(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(31 - self.bitmap.leading_zeros() as usize)
        }
    }
}

impl SchedPolicy for PriorityRr {
    fn add(&self, _task: ObjectId, _pri: Priority) {}

    fn remove(&self, task: ObjectId) {
        let mut inner = self.inner.lock();
        for lvl in 0..32 {
            inner.levels[lvl].retain(|t| *t != task);
            if inner.levels[lvl].is_empty() {
                inner.bitmap &= !(1 << lvl);
            }
        }
    }

    fn ready(&self, task: ObjectId, pri: Priority) -> bool {
        let mut inner = self.inner.lock();
        let lvl = pri.0 as usize & 31;
        inner.levels[lvl].push_back(task);
        inner.bitmap |= 1 << lvl;
        // Preempt only if this beats what the worker is running.
        match inner.running_pri {
            Some(cur) => pri.is_more_important_than(cur),
            None => false,
        }
    }

    fn block(&self, _task: ObjectId) {
        self.inner.lock().running_pri = None;
    }

    fn get_next(&self) -> Option<ObjectId> {
        let mut inner = self.inner.lock();
        let Some(lvl) = inner.top_level() else {
            inner.running_pri = None;
            return None;
        };
        let task = inner.levels[lvl].pop_front();
        if inner.levels[lvl].is_empty() {
            inner.bitmap &= !(1 << lvl);
        }
        inner.running_pri = task.map(|_| Priority(lvl as u8));
        task
    }

    fn tick(&self, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(top) = inner.top_level() else {
            return false;
        };
        let Some(cur) = inner.running_pri else {
            // Worker idle but work queued: nudge it.
            return true;
        };
        if Priority(top as u8).is_more_important_than(cur) {
            // Backstop for a missed preemption signal.
            return true;
        }
        // Same-level round-robin on timeslice expiry.
        if top == cur.0 as usize && now.wrapping_sub(inner.slice_start) >= TIMESLICE_TICKS {
            inner.slice_start = now;
            return true;
        }
        false
    }
}
