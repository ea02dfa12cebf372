// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime bring-up and teardown.
//!
//! All the process-wide singletons -- directory, message pool, log, timer
//! wheel, exception chain, name table -- live in one owned [`Runtime`]
//! value. Because signal handlers and in-task convenience calls need to
//! reach it without a reference in hand, the active runtime is registered
//! in a process-global pointer for its lifetime; one runtime at a time.
//!
//! Shutdown is an explicit quiesce sequence, in order: stop flag up, wake
//! every worker, join workers, stop the clock, cancel timers, destroy the
//! remaining directory objects, drain the log to its sink, release the
//! sink, deregister. Nothing is torn down while something that could still
//! log or wake is alive.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use abi::{ErrorCode, ExceptionType, ObjectId, Priority, TaskFlags};

use crate::config::{
    LOG_PATH, MAX_OBJECTS, MAX_WORKERS, MSG_POOL_SIZE, NAME_TABLE_CAPACITY, TASK_STACK_SIZE,
    TICKS_PER_SEC,
};
use crate::dir::{Directory, ObjGuard};
use crate::fault::{self, ExceptionChain, ExceptionHandler};
use crate::log::Log;
use crate::msg::MsgNode;
use crate::name::NameTable;
use crate::platform::mem::TaskStack;
use crate::platform::signal;
use crate::pool::Pool;
use crate::sched::{SchedKind, SchedObj};
use crate::task::{self, Task};
use crate::timer::TimerWheel;
use crate::{sched, worker};

/// Init parameters.
pub struct Config {
    /// One worker per entry, each driven by the given scheduler kind.
    pub workers: Vec<SchedKind>,
    /// Log sink path.
    pub log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: vec![SchedKind::Priority],
            log_path: PathBuf::from(LOG_PATH),
        }
    }
}

/// Parameters for a new task.
pub struct TaskDesc {
    pub name: String,
    pub priority: Priority,
    /// Scheduler (and thus worker) the task lives on.
    pub scheduler: ObjectId,
    pub flags: TaskFlags,
}

impl TaskDesc {
    pub fn new(name: &str, priority: Priority, scheduler: ObjectId) -> TaskDesc {
        TaskDesc {
            name: name.to_owned(),
            priority,
            scheduler,
            flags: TaskFlags::START,
        }
    }
}

static ACTIVE: AtomicPtr<Runtime> = AtomicPtr::new(core::ptr::null_mut());

/// The active runtime, if one is running. Valid from `start` until the end
/// of `shutdown`.
pub fn active() -> Option<&'static Runtime> {
    let p = ACTIVE.load(Ordering::SeqCst);
    // Safety: the pointer is published only while the Arc behind it is
    // alive, and cleared (with workers joined) before it drops.
    unsafe { p.as_ref() }
}

pub struct Runtime {
    dir: Directory,
    msg_pool: Pool<MsgNode>,
    log: Log,
    timer: TimerWheel,
    chain: ExceptionChain,
    names: NameTable,
    /// Scheduler ids, indexed by worker.
    scheds: Vec<ObjectId>,
    ticks: AtomicU64,
    stopping: AtomicBool,
    exit_status: AtomicI32,
    torn_down: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Brings the runtime up: registers the singletons, installs signal
    /// handlers, starts one worker thread per configured scheduler plus
    /// the clock and log-flush threads. Returns once everything is
    /// dispatching.
    pub fn start(cfg: Config) -> Result<Arc<Runtime>, ErrorCode> {
        Self::start_inner(cfg, false).map(|(rt, _)| rt)
    }

    /// As [`Runtime::start`], but the calling thread becomes worker 0 and
    /// this returns only on shutdown, with the exit status.
    pub fn run(cfg: Config) -> Result<i32, ErrorCode> {
        let (rt, sched0) = Self::start_inner(cfg, true)?;
        worker::run_worker(&rt, 0, sched0);
        Ok(rt.shutdown())
    }

    fn start_inner(
        cfg: Config,
        use_current_thread: bool,
    ) -> Result<(Arc<Runtime>, ObjectId), ErrorCode> {
        if cfg.workers.is_empty() || cfg.workers.len() > MAX_WORKERS {
            return Err(ErrorCode::InvalidState);
        }

        let dir = Directory::new(MAX_OBJECTS);
        let mut scheds = Vec::with_capacity(cfg.workers.len());
        for (i, kind) in cfg.workers.iter().enumerate() {
            let id = dir.insert(Box::new(SchedObj::new(format!("sched{i}"), *kind, i)))?;
            scheds.push(id);
            dir.insert(Box::new(worker::WorkerObj::new(i)))?;
        }

        let rt = Arc::new(Runtime {
            dir,
            msg_pool: Pool::new(MSG_POOL_SIZE),
            log: Log::new(&cfg.log_path)?,
            timer: TimerWheel::new(),
            chain: ExceptionChain::new(),
            names: NameTable::new(NAME_TABLE_CAPACITY),
            scheds,
            ticks: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            torn_down: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        // Claim the process slot before anything can fault or log.
        let raw = Arc::as_ptr(&rt) as *mut Runtime;
        if ACTIVE
            .compare_exchange(
                core::ptr::null_mut(),
                raw,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(ErrorCode::AlreadyExists);
        }
        if let Err(e) = signal::install() {
            ACTIVE.store(core::ptr::null_mut(), Ordering::SeqCst);
            return Err(e);
        }

        if let Err(e) = rt.start_threads(use_current_thread) {
            // Unwind the partial bring-up: anything already running sees
            // the stop flag and exits.
            rt.stopping.store(true, Ordering::SeqCst);
            for i in 0..rt.scheds.len() {
                worker::wake(i);
            }
            for t in core::mem::take(&mut *rt.threads.lock().unwrap()) {
                let _ = t.join();
            }
            ACTIVE.store(core::ptr::null_mut(), Ordering::SeqCst);
            signal::uninstall();
            return Err(e);
        }

        crate::rlog!("runtime up: {} workers", rt.scheds.len());
        let sched0 = rt.scheds[0];
        Ok((rt, sched0))
    }

    fn start_threads(self: &Arc<Runtime>, use_current_thread: bool) -> Result<(), ErrorCode> {
        let first_spawned = if use_current_thread { 1 } else { 0 };
        for i in first_spawned..self.scheds.len() {
            let rt = self.clone();
            let sid = self.scheds[i];
            let t = std::thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .spawn(move || worker::run_worker(&rt, i, sid))
                .map_err(|_| ErrorCode::PlatformError)?;
            self.threads.lock().unwrap().push(t);
        }

        let rt = self.clone();
        let t = std::thread::Builder::new()
            .name("weft-clock".into())
            .spawn(move || clock_loop(&rt))
            .map_err(|_| ErrorCode::PlatformError)?;
        self.threads.lock().unwrap().push(t);

        let rt = self.clone();
        let t = std::thread::Builder::new()
            .name("weft-log".into())
            .spawn(move || flush_loop(&rt))
            .map_err(|_| ErrorCode::PlatformError)?;
        self.threads.lock().unwrap().push(t);
        Ok(())
    }

    /// Requests shutdown with `status`. Returns to non-task callers; when
    /// called from a task, unwinds the calling task and does not return.
    pub fn exit(&self, status: i32) {
        self.exit_status.store(status, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);
        for i in 0..self.scheds.len() {
            worker::wake(i);
            worker::interrupt(i);
        }
        if let Some(t) = worker::current_task() {
            t.set_killed();
            task::unwind_if_killed(t);
        }
    }

    /// Runs the quiesce sequence (idempotent) and returns the exit status.
    /// Must be called from outside the runtime's own threads.
    pub fn shutdown(&self) -> i32 {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.stopping.store(true, Ordering::SeqCst);
            for i in 0..self.scheds.len() {
                worker::wake(i);
                worker::interrupt(i);
            }

            let threads = core::mem::take(&mut *self.threads.lock().unwrap());
            for t in threads {
                let _ = t.join();
            }

            self.timer.clear();

            // Destroy whatever is still registered: blocked tasks, sems,
            // schedulers. Their free hooks can still log and reach the
            // message pool.
            let mut live = Vec::new();
            self.dir.for_each_live(|id| live.push(id));
            for id in live {
                self.dir.destroy(id);
            }

            crate::rlog!("runtime down, status {}", self.exit_status.load(Ordering::SeqCst));
            self.log.quiesce();

            ACTIVE.store(core::ptr::null_mut(), Ordering::SeqCst);
            signal::uninstall();
        }
        self.exit_status.load(Ordering::SeqCst)
    }

    /// Fatal path: something unrecoverable happened. Flushes what the log
    /// ring holds and exits the process without unwinding.
    pub(crate) fn fatal(&self) -> ! {
        self.stopping.store(true, Ordering::SeqCst);
        self.log.quiesce();
        let status = self.exit_status.load(Ordering::SeqCst);
        // Safety: process exit.
        unsafe {
            libc::_exit(if status == 0 { 1 } else { status });
        }
    }

    /// Creates a task on the given scheduler. With `TaskFlags::START` (the
    /// `TaskDesc::new` default) it is made runnable immediately; otherwise
    /// it waits in `Stopped` for [`Runtime::task_start`].
    pub fn spawn(
        &self,
        desc: TaskDesc,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<ObjectId, ErrorCode> {
        if self.dir.find_as::<SchedObj>(desc.scheduler).is_none() {
            return Err(ErrorCode::NotFound);
        }
        let stack = TaskStack::map(TASK_STACK_SIZE)?;
        let task = Task::new(
            &desc.name,
            desc.priority,
            desc.scheduler,
            stack,
            Box::new(entry),
        )?;
        let id = self.dir.insert(task)?;
        if let Some(t) = self.dir.find_as::<Task>(id) {
            t.set_id(id);
        }
        sched::add(self, desc.scheduler, id, desc.priority)?;
        crate::rlog!("spawn {:08x} '{}' pri={}", id.0, desc.name, desc.priority.0);
        if desc.flags.contains(TaskFlags::START) {
            task::start(self, id)?;
        }
        Ok(id)
    }

    /// Makes a `Stopped` task runnable.
    pub fn task_start(&self, id: ObjectId) -> Result<(), ErrorCode> {
        task::start(self, id)
    }

    /// Kills a task (cooperative: it unwinds at its next safe point or
    /// wake).
    pub fn kill_task(&self, id: ObjectId) -> Result<(), ErrorCode> {
        task::kill(self, id)
    }

    /// Registers `id` in the name table under its object's name.
    pub fn name_alloc(&self, id: ObjectId) -> Result<(), ErrorCode> {
        self.names.alloc(&self.dir, id)
    }

    /// Unregisters `id` from the name table.
    pub fn name_free(&self, id: ObjectId) -> Result<(), ErrorCode> {
        self.names.free(id)
    }

    /// Resolves a name to a handle without locking the object.
    pub fn name_find(&self, key: &str) -> Option<ObjectId> {
        self.names.find(key)
    }

    /// Resolves a name and locks the object, guaranteeing a live reference
    /// for the guard's lifetime.
    pub fn name_find_and_lock(&self, key: &str) -> Option<(ObjectId, ObjGuard<'_>)> {
        self.names.find_and_lock(&self.dir, key)
    }

    /// Appends a handler to the exception chain.
    pub fn register_exception_handler(&self, h: ExceptionHandler) -> Result<(), ErrorCode> {
        self.chain.register(h)
    }

    /// Raises an exception through the chain.
    pub fn raise(&self, ty: ExceptionType, extra: usize) {
        fault::raise(self, ty, extra);
    }

    /// Scheduler handle for worker `index`.
    pub fn scheduler(&self, index: usize) -> Option<ObjectId> {
        self.scheds.get(index).copied()
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// One-line-per-object directory dump.
    pub fn dump(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        self.dir.dump(out)
    }

    pub(crate) fn dir(&self) -> &Directory {
        &self.dir
    }

    pub(crate) fn msg_pool(&self) -> &Pool<MsgNode> {
        &self.msg_pool
    }

    pub(crate) fn timer(&self) -> &TimerWheel {
        &self.timer
    }

    pub(crate) fn log(&self) -> &Log {
        &self.log
    }

    pub(crate) fn chain(&self) -> &ExceptionChain {
        &self.chain
    }

    pub(crate) fn scheduler_ids(&self) -> &[ObjectId] {
        &self.scheds
    }
}

/// The clock thread: advances the global tick, fires timers, gives every
/// scheduler its tick. Runs behind a fixed-rate schedule and catches up
/// without sleeping when it falls behind.
fn clock_loop(rt: &Runtime) {
    let period = Duration::from_nanos(1_000_000_000 / TICKS_PER_SEC);
    let mut next = Instant::now() + period;
    while !rt.is_stopping() {
        let now = Instant::now();
        if now < next {
            std::thread::sleep(next - now);
        }
        next += period;

        let t = rt.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        rt.timer.tick(rt, t);
        sched::tick_all(rt, t);
    }
}

/// The log flush thread: drains the ring to the sink until shutdown.
fn flush_loop(rt: &Runtime) {
    loop {
        let drained = rt.log.flush();
        if rt.is_stopping() && drained == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
