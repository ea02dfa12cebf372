// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! weft: a user-space task-multiplexing runtime.
//!
//! Many lightweight cooperative tasks are multiplexed across a pool of
//! OS-thread workers, each driven by a pluggable scheduler. Tasks talk
//! through typed message queues, synchronize on one-shot events (behind
//! semaphores, timers, and message waits), and are addressed through a
//! process-wide object directory handing out generation-checked ids.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled runtime, some ideas appear
//! consistently:
//!
//! 1. Static configuration. The system takes a single shape specified at
//!    compile time (`config`); bounded pools instead of growth.
//! 2. Handles, not pointers. Everything long-lived is reached through
//!    `(index, generation)` ids dereferenced under a lock count, so stale
//!    references miss instead of aliasing.
//! 3. Signal handlers do almost nothing. The preemption handler records a
//!    bit; rescheduling happens at safe points the interrupted code
//!    chooses.
//! 4. A strong preference for safe code where reasonable; the `unsafe`
//!    that remains is concentrated in the pool/queue protocols and the
//!    context switch.
//!
//! # A task's-eye view
//!
//! ```ignore
//! let rt = Runtime::start(Config::default())?;
//! let sched = rt.scheduler(0).unwrap();
//! rt.spawn(TaskDesc::new("echo", Priority(4), sched), move || {
//!     let rt = weft::active().unwrap();
//!     loop {
//!         let msg = match rt.recv() {
//!             Ok(m) => m,
//!             Err(_) => break,
//!         };
//!         let _ = rt.send(msg.sender(), /* reply */ msg);
//!     }
//! })?;
//! ```

pub mod arch;
pub mod config;
pub mod dir;
pub mod event;
pub mod fault;
pub mod log;
pub mod msg;
pub mod name;
pub mod platform;
pub mod pool;
pub mod queue;
pub mod ring;
pub mod sched;
pub mod sem;
pub mod startup;
pub mod task;
pub mod timer;
pub mod worker;

pub use abi::{
    Disposition, ErrorCode, EventSource, ExceptionType, Generation, ObjectId, Priority,
    TaskFlags, TaskState,
};

pub use crate::dir::Object;
pub use crate::fault::{ExceptionHandler, ExceptionInfo};
pub use crate::msg::{Msg, MsgFilter, MsgView};
pub use crate::sched::SchedKind;
pub use crate::startup::{active, Config, Runtime, TaskDesc};
pub use crate::worker::current_task_id;

/// Yields the CPU to the next runnable task on this worker. No-op outside
/// task context.
pub fn yield_now() {
    if let Some(rt) = active() {
        task::yield_current(rt);
    }
}

/// Blocks the calling task for `ticks` timer ticks.
pub fn sleep(ticks: u64) {
    if let Some(rt) = active() {
        task::sleep_current(rt, ticks);
    }
}

/// Explicit safe point: lets a recorded preemption or kill take effect.
/// Long-running loops in task code should call this.
pub fn safe_point() {
    if let Some(rt) = active() {
        worker::safe_point(rt);
    }
}

/// Masks preemption on the calling worker until the matching
/// [`int_enable`].
pub fn int_disable() {
    worker::int_disable();
}

/// Unmasks preemption; a reschedule recorded while masked happens here.
pub fn int_enable() {
    if let Some(rt) = active() {
        worker::int_enable(rt);
    }
}
