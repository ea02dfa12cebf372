// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workers: the kernel threads that multiplex tasks.
//!
//! Each worker runs the dispatch loop `get_next -> switch -> inspect`,
//! parking when its scheduler is empty. Per-worker state that signal
//! handlers need -- the owning thread, the current task pointer, the
//! interrupt mask, the pending-reschedule bit, the dispatcher context --
//! lives in a fixed static registry so a handler can find its slot by
//! `pthread_self` with nothing but atomic loads.
//!
//! The preemption signal handler never switches contexts; it records the
//! pending bit and returns. The actual reschedule happens at the next safe
//! point: a yield, a block/wake edge, or an explicit [`safe_point`] poll in
//! long-running task code.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::panic::{catch_unwind, AssertUnwindSafe};

use abi::{ObjectId, Priority, TaskState};

use crate::arch::{weft_context_switch, Context};
use crate::config::MAX_WORKERS;
use crate::platform::park::Parker;
use crate::platform::signal;
use crate::startup::Runtime;
use crate::task::{self, Task};
use crate::{fault, sched};

pub(crate) struct WorkerSlot {
    active: AtomicBool,
    /// `pthread_t` of the worker, for handler-side identification and
    /// targeted signals.
    thread: AtomicU64,
    current_task: AtomicPtr<Task>,
    current_task_id: AtomicU32,
    current_pri: AtomicU8,
    /// Interrupts-disabled depth. While nonzero, pending reschedules are
    /// recorded but not acted on.
    int_depth: AtomicU32,
    pending: AtomicBool,
    parker: Parker,
    /// Where the dispatch loop suspended when it switched into a task.
    dispatcher_ctx: UnsafeCell<Context>,
}

// dispatcher_ctx is only written by the owning thread (and read by the
// fault handler running on that same thread).
unsafe impl Sync for WorkerSlot {}

impl WorkerSlot {
    /// Raw pointer to the task this worker is executing, for the fault
    /// handler (which cannot take guards).
    pub(crate) fn current_task_ptr(&self) -> *mut Task {
        self.current_task.load(Ordering::SeqCst)
    }

    const fn new() -> Self {
        WorkerSlot {
            active: AtomicBool::new(false),
            thread: AtomicU64::new(0),
            current_task: AtomicPtr::new(core::ptr::null_mut()),
            current_task_id: AtomicU32::new(0),
            current_pri: AtomicU8::new(0),
            int_depth: AtomicU32::new(0),
            pending: AtomicBool::new(false),
            parker: Parker::new(),
            dispatcher_ctx: UnsafeCell::new(Context::zeroed()),
        }
    }
}

static REGISTRY: [WorkerSlot; MAX_WORKERS] = [const { WorkerSlot::new() }; MAX_WORKERS];

thread_local! {
    static WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Index of the worker the calling thread is, if it is one.
pub fn current_index() -> Option<usize> {
    let idx = WORKER_INDEX.with(|c| c.get());
    (idx != usize::MAX).then_some(idx)
}

pub(crate) fn slot(idx: usize) -> &'static WorkerSlot {
    &REGISTRY[idx]
}

/// The task currently running on this thread, if any. The reference is
/// valid for the duration of the task's run: the dispatcher holds a
/// directory lock on it the whole time.
pub(crate) fn current_task<'a>() -> Option<&'a Task> {
    let idx = current_index()?;
    let ptr = REGISTRY[idx].current_task.load(Ordering::SeqCst);
    // Safety: set non-null only while the dispatcher pins the task.
    unsafe { ptr.as_ref() }
}

/// Id of the task currently running on this thread.
pub fn current_task_id() -> Option<ObjectId> {
    current_task().map(|t| t.id())
}

/// Priority of the task running on worker `idx`, or `None` when idle.
pub(crate) fn current_priority(idx: usize) -> Option<Priority> {
    let slot = &REGISTRY[idx];
    if slot.current_task.load(Ordering::SeqCst).is_null() {
        None
    } else {
        Some(Priority(slot.current_pri.load(Ordering::SeqCst)))
    }
}

/// Unparks worker `idx` (it may be idle waiting for work).
pub(crate) fn wake(idx: usize) {
    if idx < MAX_WORKERS {
        REGISTRY[idx].parker.unpark();
    }
}

/// Delivers the preemption signal to worker `idx`.
pub(crate) fn interrupt(idx: usize) {
    if idx >= MAX_WORKERS {
        return;
    }
    let slot = &REGISTRY[idx];
    if slot.active.load(Ordering::SeqCst) {
        signal::interrupt_thread(slot.thread.load(Ordering::SeqCst) as libc::pthread_t);
    }
}

/// Handler-side: finds the calling thread's worker slot. Atomic loads
/// only.
pub(crate) fn find_self() -> Option<usize> {
    let me = unsafe { libc::pthread_self() } as u64;
    (0..MAX_WORKERS).find(|&i| {
        REGISTRY[i].active.load(Ordering::SeqCst)
            && REGISTRY[i].thread.load(Ordering::SeqCst) == me
    })
}

/// Body of the preemption signal handler: record and return. Whether the
/// interrupt mask is up only affects when the bit is *acted* on.
pub(crate) fn note_preempt_signal() {
    if let Some(idx) = find_self() {
        REGISTRY[idx].pending.store(true, Ordering::SeqCst);
    }
}

/// Raises the interrupt mask on the calling worker.
pub fn int_disable() {
    if let Some(idx) = current_index() {
        REGISTRY[idx].int_depth.fetch_add(1, Ordering::SeqCst);
    }
}

/// Lowers the interrupt mask; a pending reschedule recorded while masked is
/// processed immediately on the last enable.
pub fn int_enable(rt: &Runtime) {
    if let Some(idx) = current_index() {
        let prev = REGISTRY[idx].int_depth.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "int_enable without int_disable");
        if prev == 1 {
            safe_point(rt);
        }
    }
}

/// Explicit preemption poll. Long-running task code calls this (directly
/// or via the blocking primitives) to let a recorded preemption take
/// effect; it is also where a killed task starts its unwind.
pub fn safe_point(rt: &Runtime) {
    let Some(idx) = current_index() else {
        return;
    };
    let Some(task) = current_task() else {
        return;
    };
    task::unwind_if_killed(task);
    let slot = &REGISTRY[idx];
    if slot.int_depth.load(Ordering::SeqCst) == 0 && slot.pending.swap(false, Ordering::SeqCst)
    {
        task::yield_current(rt);
    }
}

/// Switches from the running task back to its worker's dispatcher.
pub(crate) fn switch_to_dispatcher(task: &Task) {
    let idx = current_index().expect("switch outside worker");
    let slot = &REGISTRY[idx];
    // Safety: the dispatcher context was saved by the switch that resumed
    // us, and the task context slot is ours to save into.
    unsafe {
        weft_context_switch(task.ctx_ptr(), slot.dispatcher_ctx.get());
    }
}

/// Fault-handler side: abandons the interrupted task context outright and
/// installs the worker's dispatcher context. Nothing is saved -- the dead
/// task will never be resumed.
pub(crate) fn abandon_task_to_dispatcher(idx: usize) -> ! {
    let slot = &REGISTRY[idx];
    // Safety: the dispatcher context was saved when this worker switched
    // into the now-dead task, and we are on that worker's thread.
    unsafe { crate::arch::weft_context_restore(slot.dispatcher_ctx.get()) }
}

/// A worker's directory presence. Introspection only -- the live state is
/// in the registry slot, which outlives any one runtime.
pub(crate) struct WorkerObj {
    name: String,
    index: usize,
}

impl WorkerObj {
    pub(crate) fn new(index: usize) -> WorkerObj {
        WorkerObj {
            name: format!("worker{index}"),
            index,
        }
    }
}

impl crate::dir::Object for WorkerObj {
    fn kind(&self) -> &'static str {
        "worker"
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn describe(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        let slot = &REGISTRY[self.index];
        let cur = slot.current_task_id.load(Ordering::SeqCst);
        if cur == ObjectId::INVALID.0 {
            write!(out, "{} idle", self.name)
        } else {
            write!(out, "{} running {:08x}", self.name, cur)
        }
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

/// Removes a task from its scheduler and the directory.
pub(crate) fn reap(rt: &Runtime, id: ObjectId) {
    let sched_id = rt.dir().find_as::<Task>(id).map(|t| t.sched_id());
    if let Some(s) = sched_id {
        sched::remove(rt, s, id);
    }
    rt.dir().destroy(id);
}

/// The dispatch loop. Runs until shutdown; `idx` is this worker's slot and
/// `sched_id` its scheduler.
pub(crate) fn run_worker(rt: &Runtime, idx: usize, sched_id: ObjectId) {
    WORKER_INDEX.with(|c| c.set(idx));
    let slot = &REGISTRY[idx];
    slot.thread
        .store(unsafe { libc::pthread_self() } as u64, Ordering::SeqCst);
    slot.pending.store(false, Ordering::SeqCst);
    slot.int_depth.store(0, Ordering::SeqCst);
    slot.active.store(true, Ordering::SeqCst);
    let _altstack = signal::AltStack::install();

    crate::rlog!("worker {idx}: dispatching");

    while !rt.is_stopping() {
        int_disable();
        let next = sched::get_next(rt, sched_id);
        // Cannot use int_enable: the dispatcher has no task to yield.
        slot.int_depth.fetch_sub(1, Ordering::SeqCst);

        match next {
            Some(tid) => run_task(rt, idx, tid),
            None => slot.parker.park(),
        }
    }

    slot.active.store(false, Ordering::SeqCst);
    slot.current_task
        .store(core::ptr::null_mut(), Ordering::SeqCst);
    WORKER_INDEX.with(|c| c.set(usize::MAX));
    crate::rlog!("worker {idx}: stopped");
}

fn run_task(rt: &Runtime, idx: usize, tid: ObjectId) {
    let slot = &REGISTRY[idx];
    let Some(task) = rt.dir().find_as::<Task>(tid) else {
        // Stale queue entry for a task that died meanwhile.
        return;
    };

    if task.is_killed() && !task.has_started() {
        // Never ran: no frames to unwind, reap cold.
        if task.cas_state(TaskState::Ready, TaskState::Zombie)
            || task.state() == TaskState::Zombie
        {
            drop(task);
            reap(rt, tid);
        }
        return;
    }

    if !task.cas_state(TaskState::Ready, TaskState::Running) {
        // Spurious wake-queue entry (see the block/wake protocol notes) or
        // a zombie that exited through a fault.
        if task.state() == TaskState::Zombie {
            drop(task);
            reap(rt, tid);
        }
        return;
    }

    let tptr = &*task as *const Task as *mut Task;
    slot.current_task_id.store(tid.0, Ordering::SeqCst);
    slot.current_pri.store(task.priority().0, Ordering::SeqCst);
    slot.current_task.store(tptr, Ordering::SeqCst);

    // Safety: task.ctx holds either a prepared entry context or the state
    // saved at its last switch-out; dispatcher_ctx is ours.
    unsafe {
        weft_context_switch(slot.dispatcher_ctx.get(), task.ctx_ptr());
    }

    slot.current_task
        .store(core::ptr::null_mut(), Ordering::SeqCst);
    slot.current_task_id
        .store(ObjectId::INVALID.0, Ordering::SeqCst);

    if task.state() == TaskState::Zombie {
        drop(task);
        reap(rt, tid);
    }
    // Blocked: a signaler will ready it. Ready: it is already queued.
}

/// First frame of every task, entered from the architecture trampoline.
///
/// Runs the entry closure under `catch_unwind` so that both panics and the
/// cooperative kill unwind release the task's locals before the stack is
/// torn down.
#[no_mangle]
extern "C" fn weft_task_main(task: *mut u8) -> ! {
    // Safety: the trampoline passes the pointer staged by Task::new, and
    // the dispatcher pins the task while it runs.
    let task = unsafe { &*(task as *const Task) };
    task.mark_started();

    let rt = crate::startup::active().expect("task running without runtime");

    if let Some(entry) = task.take_entry() {
        match catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => {}
            Err(payload) => {
                if payload.downcast_ref::<task::Killed>().is_none() {
                    // A genuine panic, not the kill unwind.
                    fault::report_panic(rt);
                }
            }
        }
    }

    task::exit_current()
}
