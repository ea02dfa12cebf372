// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! The interesting invariants live in the block/wake protocol. A task
//! blocks by (1) storing its wait event, (2) publishing state `Blocked`,
//! (3) re-checking the event, and only then (4) switching to the
//! dispatcher. A signaler publishes the event as signaled and then tries to
//! move the task `Blocked -> Ready`. With `SeqCst` on both sides, at least
//! one of them observes the other: either the waiter sees the signal and
//! aborts the block, or the signaler sees `Blocked` and enqueues the wake.
//! Both can happen; the resulting extra dispatch is absorbed by the
//! dispatcher's `Ready -> Running` CAS, which simply fails on a task that
//! is not actually ready.
//!
//! Kill is cooperative and unwinding: the killed task resumes (if blocked),
//! runs its cleanup, and leaves through a panic-style unwind that the task
//! shim catches, so locals on the task stack drop properly instead of being
//! abandoned with the stack.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use abi::{ErrorCode, EventSource, ObjectId, Priority, TaskState};

use crate::arch::Context;
use crate::event::{self, Event};
use crate::msg::MsgChannel;
use crate::platform::mem::TaskStack;
use crate::startup::Runtime;
use crate::{sched, worker};

/// Marker payload for the kill unwind, recognized by the task shim.
pub(crate) struct Killed;

pub(crate) type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Task control block. Registered in the directory; the pool slot owns it.
pub struct Task {
    name: String,
    priority: Priority,
    /// The scheduler this task belongs to, for its whole life.
    sched: ObjectId,
    state: AtomicU8,
    killed: AtomicBool,
    /// Set once the task has executed its first instruction; a killed task
    /// that never started has no frames to unwind and can be reaped cold.
    started: AtomicBool,
    entry: spin::Mutex<Option<Entry>>,
    stack: TaskStack,
    /// Saved machine context. Only the owning worker (or the fault handler
    /// running on that worker's thread) touches this, and only while the
    /// task is not running.
    ctx: UnsafeCell<Context>,
    /// The task's single owned message queue.
    pub(crate) channel: MsgChannel,
    /// Event for the currently pending blocking call, if any. Kill signals
    /// through here to unwind a blocked task.
    pub(crate) wait_event: spin::Mutex<Option<Arc<Event>>>,
    self_id: AtomicU32,
}

// `ctx` and the channel's consumer half are confined to the owning worker
// by the scheduling protocol.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new(
        name: &str,
        priority: Priority,
        sched: ObjectId,
        stack: TaskStack,
        entry: Entry,
    ) -> Result<Box<Task>, ErrorCode> {
        if name.is_empty() || name.len() > crate::config::NAME_LEN {
            return Err(ErrorCode::InvalidState);
        }
        if priority.0 > Priority::MAX.0 {
            return Err(ErrorCode::InvalidState);
        }
        let task = Box::new(Task {
            name: name.to_owned(),
            priority,
            sched,
            state: AtomicU8::new(TaskState::Stopped as u8),
            killed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            entry: spin::Mutex::new(Some(entry)),
            stack,
            ctx: UnsafeCell::new(Context::default()),
            channel: MsgChannel::new(),
            wait_event: spin::Mutex::new(None),
            self_id: AtomicU32::new(ObjectId::INVALID.0),
        });
        // Stage the first resume. The box gives the TCB its stable address.
        let ptr = &*task as *const Task as *mut Task;
        unsafe {
            crate::arch::prepare(
                &mut *task.ctx.get(),
                task.stack.top(),
                ptr as *mut u8,
            );
        }
        Ok(task)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn sched_id(&self) -> ObjectId {
        self.sched
    }

    pub fn id(&self) -> ObjectId {
        ObjectId(self.self_id.load(Ordering::Relaxed))
    }

    pub(crate) fn set_id(&self, id: ObjectId) {
        self.self_id.store(id.0, Ordering::Relaxed);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst)).unwrap_or(TaskState::Zombie)
    }

    pub(crate) fn set_state(&self, s: TaskState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub(crate) fn cas_state(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().take()
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    pub(crate) fn stack(&self) -> &TaskStack {
        &self.stack
    }
}

impl crate::dir::Object for Task {
    fn kind(&self) -> &'static str {
        "task"
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(
            out,
            "{} pri={} state={:?}",
            self.name,
            self.priority.0,
            self.state()
        )
    }

    fn on_destroy(&self) {
        if let Some(ev) = self.wait_event.lock().take() {
            ev.cancel();
        }
        if let Some(rt) = crate::startup::active() {
            // Undelivered messages go back to the pool; "returned by exactly
            // one recv unless the queue is destroyed first."
            self.channel.free_all(rt);
        }
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

/// Moves `id` from blocked to ready and tells its scheduler, if it was in
/// fact blocked. No-op against any other state, which is what makes wake
/// signals idempotent against not-yet-blocked or already-woken tasks.
pub(crate) fn make_ready(rt: &Runtime, id: ObjectId) {
    let Some(task) = rt.dir().find_as::<Task>(id) else {
        return;
    };
    if task.cas_state(TaskState::Blocked, TaskState::Ready) {
        sched::ready(rt, task.sched_id(), id, task.priority());
    }
}

/// Starts a stopped task.
pub(crate) fn start(rt: &Runtime, id: ObjectId) -> Result<(), ErrorCode> {
    let Some(task) = rt.dir().find_as::<Task>(id) else {
        return Err(ErrorCode::NotFound);
    };
    if !task.cas_state(TaskState::Stopped, TaskState::Ready) {
        return Err(ErrorCode::InvalidState);
    }
    sched::ready(rt, task.sched_id(), id, task.priority());
    Ok(())
}

/// Blocks the current task on `ev` until some source fires it. Returns the
/// winning source. Must be called from task context.
pub(crate) fn block_current(rt: &Runtime, ev: &Arc<Event>) -> EventSource {
    let task = worker::current_task().expect("block outside task context");

    *task.wait_event.lock() = Some(ev.clone());
    task.set_state(TaskState::Blocked);

    if ev.is_signaled() {
        // The signal beat us to the block; never leave the CPU.
        task.set_state(TaskState::Running);
    } else {
        sched::block(rt, task.sched_id(), task.id());
        worker::switch_to_dispatcher(task);
    }

    *task.wait_event.lock() = None;
    match ev.source() {
        Some(src) => src,
        None => {
            // Resumed without a signal; treat as a kill-grade anomaly so the
            // caller unwinds instead of spinning on a phantom wake.
            crate::rlog!("task {:?}: woke with armed event", task.id());
            EventSource::Kill
        }
    }
}

/// Voluntarily gives up the CPU; the task goes to the back of its ready
/// queue.
pub(crate) fn yield_current(rt: &Runtime) {
    let Some(task) = worker::current_task() else {
        return;
    };
    unwind_if_killed(task);
    task.set_state(TaskState::Ready);
    sched::ready(rt, task.sched_id(), task.id(), task.priority());
    worker::switch_to_dispatcher(task);
    unwind_if_killed(task);
}

/// Blocks the current task for `ticks` timer ticks.
pub(crate) fn sleep_current(rt: &Runtime, ticks: u64) {
    if ticks == 0 {
        yield_current(rt);
        return;
    }
    let task = worker::current_task().expect("sleep outside task context");
    unwind_if_killed(task);
    let ev = Event::new(task.id());
    let handle = rt.timer().queue(rt.now(), ticks, ev.clone(), EventSource::Timer);
    let src = block_current(rt, &ev);
    if src != EventSource::Timer {
        rt.timer().cancel(&handle);
    }
    unwind_if_killed(task);
}

/// Terminates the current task. Switches away forever; the dispatcher
/// reaps the zombie.
pub(crate) fn exit_current() -> ! {
    let task = worker::current_task().expect("exit outside task context");
    task.set_state(TaskState::Zombie);
    worker::switch_to_dispatcher(task);
    unreachable!("resumed a zombie");
}

/// Starts the cooperative kill unwind if this task has been marked killed.
/// The unwind is caught by the task shim; locals drop on the way out.
pub(crate) fn unwind_if_killed(task: &Task) {
    if task.is_killed() {
        std::panic::resume_unwind(Box::new(Killed));
    }
}

/// Kills a task: marks it, then nudges it toward its exit path. Blocked
/// tasks are woken through their wait event with the `Kill` source; running
/// tasks are interrupted and unwind at their next safe point; stopped tasks
/// are reaped on the spot.
pub(crate) fn kill(rt: &Runtime, id: ObjectId) -> Result<(), ErrorCode> {
    let self_kill = worker::current_task().map(|t| t.id()) == Some(id);

    {
        let Some(task) = rt.dir().find_as::<Task>(id) else {
            return Err(ErrorCode::NotFound);
        };
        task.set_killed();

        match task.state() {
            TaskState::Stopped => {
                if task.cas_state(TaskState::Stopped, TaskState::Zombie) {
                    drop(task);
                    worker::reap(rt, id);
                    return Ok(());
                }
            }
            TaskState::Blocked => {
                let ev = task.wait_event.lock().clone();
                if let Some(ev) = ev {
                    event::fire(rt, &ev, EventSource::Kill);
                }
            }
            TaskState::Running => {
                if !self_kill {
                    sched::interrupt_worker(rt, task.sched_id());
                }
            }
            TaskState::Ready | TaskState::Zombie => {}
        }
    }

    if self_kill {
        // Suicide: unwind immediately rather than waiting for a safe point.
        std::panic::resume_unwind(Box::new(Killed));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TASK_STACK_SIZE;

    fn stack() -> TaskStack {
        TaskStack::map(TASK_STACK_SIZE).unwrap()
    }

    #[test]
    fn rejects_bad_names_and_priorities() {
        assert!(Task::new("", Priority(0), ObjectId::INVALID, stack(), Box::new(|| {})).is_err());
        let long = "x".repeat(crate::config::NAME_LEN + 1);
        assert!(
            Task::new(&long, Priority(0), ObjectId::INVALID, stack(), Box::new(|| {})).is_err()
        );
        assert!(
            Task::new("ok", Priority(99), ObjectId::INVALID, stack(), Box::new(|| {})).is_err()
        );
    }

    #[test]
    fn fresh_task_is_stopped() {
        let t = Task::new("t", Priority(3), ObjectId::INVALID, stack(), Box::new(|| {})).unwrap();
        assert_eq!(t.state(), TaskState::Stopped);
        assert!(!t.is_killed());
        assert!(!t.has_started());
        assert!(t.take_entry().is_some());
        assert!(t.take_entry().is_none());
    }

    #[test]
    fn state_cas_respects_current() {
        let t = Task::new("t", Priority(3), ObjectId::INVALID, stack(), Box::new(|| {})).unwrap();
        assert!(t.cas_state(TaskState::Stopped, TaskState::Ready));
        assert!(!t.cas_state(TaskState::Stopped, TaskState::Ready));
        assert!(t.cas_state(TaskState::Ready, TaskState::Running));
        assert_eq!(t.state(), TaskState::Running);
    }
}
