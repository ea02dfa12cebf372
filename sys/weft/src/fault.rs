// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The exception handler chain.
//!
//! A process-wide ordered list of handlers. `raise` (and the OS fault
//! handler) walks it in registration order; the first non-`Forward` answer
//! decides what happens. Handlers are bare function pointers so the walk
//! allocates nothing and can run from a signal handler; the chain's
//! spinlock is held only long enough to copy the pointer list out.
//!
//! Fault signals arrive on the worker's alternate stack. When the verdict
//! is `KillTask`, the handler abandons the interrupted task outright and
//! switches to the worker's dispatcher -- the task will never be resumed, so
//! nothing is saved. `SA_NODEFER` keeps the signal deliverable after we
//! walk away from the handler frame without returning.

use abi::{Disposition, ErrorCode, ExceptionType, ObjectId, TaskState};

use crate::platform::signal;
use crate::startup::{self, Runtime};
use crate::{task, worker};

const MAX_HANDLERS: usize = 16;

/// What a handler is shown.
#[derive(Debug)]
pub struct ExceptionInfo {
    pub ty: ExceptionType,
    /// Extra discriminating data: user-raise argument, or `si_code`.
    pub extra: usize,
    /// Task that hit the condition, if the condition has a task.
    pub task: ObjectId,
    /// Worker it happened on, if any.
    pub worker: Option<usize>,
    /// Faulting address, for memory faults.
    pub fault_addr: Option<usize>,
}

pub type ExceptionHandler = fn(&ExceptionInfo) -> Disposition;

pub(crate) struct ExceptionChain {
    handlers: spin::Mutex<([Option<ExceptionHandler>; MAX_HANDLERS], usize)>,
}

impl ExceptionChain {
    pub(crate) fn new() -> Self {
        ExceptionChain {
            handlers: spin::Mutex::new(([None; MAX_HANDLERS], 0)),
        }
    }

    /// Appends a handler. Registration order is dispatch order.
    pub(crate) fn register(&self, h: ExceptionHandler) -> Result<(), ErrorCode> {
        let mut guard = self.handlers.lock();
        let (list, len) = &mut *guard;
        if *len == MAX_HANDLERS {
            return Err(ErrorCode::OutOfMemory);
        }
        list[*len] = Some(h);
        *len += 1;
        Ok(())
    }

    /// Walks the chain; `None` means every handler forwarded.
    fn walk(&self, info: &ExceptionInfo) -> Option<Disposition> {
        let (list, len) = *self.handlers.lock();
        for h in list[..len].iter().flatten() {
            match h(info) {
                Disposition::Forward => continue,
                d => return Some(d),
            }
        }
        None
    }
}

/// Built-in policy when no registered handler claims the condition.
fn default_disposition(ty: ExceptionType) -> Disposition {
    match ty {
        ExceptionType::User(_) => Disposition::Continue,
        ExceptionType::Internal => Disposition::Exit,
        _ => Disposition::KillTask,
    }
}

fn dispose(rt: &Runtime, info: &ExceptionInfo) -> Disposition {
    rt.chain()
        .walk(info)
        .unwrap_or_else(|| default_disposition(info.ty))
}

/// Raises an exception from regular code (user raises, internal errors).
///
/// `Continue` logs and returns; `KillTask` unwinds the calling task (or
/// just logs if there is no task); `Exit` takes the process down through
/// the fatal path.
pub fn raise(rt: &Runtime, ty: ExceptionType, extra: usize) {
    let info = ExceptionInfo {
        ty,
        extra,
        task: worker::current_task_id().unwrap_or(ObjectId::INVALID),
        worker: worker::current_index(),
        fault_addr: None,
    };
    match dispose(rt, &info) {
        Disposition::Continue => {
            crate::rlog!("exception {:?} on {:08x}: continue", ty, info.task.0);
        }
        Disposition::KillTask => {
            crate::rlog!("exception {:?} on {:08x}: kill", ty, info.task.0);
            if let Some(t) = worker::current_task() {
                t.set_killed();
                task::unwind_if_killed(t);
            }
        }
        Disposition::Exit | Disposition::Forward => {
            crate::rlog!("exception {:?}: fatal", ty);
            rt.fatal();
        }
    }
}

/// Panic fallout from the task shim. The task is already past its entry;
/// this only consults the chain for an `Exit` escalation and logs.
pub(crate) fn report_panic(rt: &Runtime) {
    let info = ExceptionInfo {
        ty: ExceptionType::Panic,
        extra: 0,
        task: worker::current_task_id().unwrap_or(ObjectId::INVALID),
        worker: worker::current_index(),
        fault_addr: None,
    };
    match dispose(rt, &info) {
        Disposition::Exit => {
            crate::rlog!("task {:08x} panicked: fatal", info.task.0);
            rt.fatal();
        }
        _ => {
            crate::rlog!("task {:08x} panicked: killed", info.task.0);
        }
    }
}

fn classify(sig: libc::c_int, code: libc::c_int, addr: usize, task: &task::Task) -> ExceptionType {
    match sig {
        libc::SIGSEGV => {
            if task.stack().guard_contains(addr) {
                ExceptionType::StackOverflow
            } else {
                ExceptionType::Segfault
            }
        }
        libc::SIGBUS => ExceptionType::Bus,
        libc::SIGILL => ExceptionType::IllegalInstruction,
        libc::SIGFPE => match code {
            libc::FPE_INTDIV | libc::FPE_INTOVF => ExceptionType::Integer,
            _ => ExceptionType::Fp,
        },
        _ => ExceptionType::Internal,
    }
}

/// Body of the OS fault-signal handler. Runs on the worker's alternate
/// stack with the faulting task's state still live.
pub(crate) fn on_fault_signal(sig: libc::c_int, code: libc::c_int, addr: usize) {
    let Some(idx) = worker::find_self() else {
        // Fault on a non-worker thread: not ours to absorb.
        signal::die_by_default_disposition(sig);
    };
    let tptr = {
        let slot = worker::slot(idx);
        slot.current_task_ptr()
    };
    if tptr.is_null() {
        // Fault inside the runtime itself. Unrecoverable.
        signal::die_by_default_disposition(sig);
    }
    // Safety: the dispatcher pins the current task while it runs; we are on
    // that worker's thread.
    let task = unsafe { &*tptr };

    let Some(rt) = startup::active() else {
        signal::die_by_default_disposition(sig);
    };

    let ty = classify(sig, code, addr, task);
    let info = ExceptionInfo {
        ty,
        extra: sig as usize,
        task: task.id(),
        worker: Some(idx),
        fault_addr: Some(addr),
    };

    match dispose(rt, &info) {
        Disposition::Continue => {
            // Handler fixed the world; retry the faulting instruction.
        }
        Disposition::KillTask => {
            crate::rlog!(
                "task {:08x}: {:?} at {:#x}, killed",
                info.task.0,
                ty,
                addr
            );
            task.set_killed();
            task.set_state(TaskState::Zombie);
            // The task's locals cannot be unwound from here -- the stack
            // may be the thing that's broken. Abandon the context; the
            // dispatcher reaps the zombie.
            worker::abandon_task_to_dispatcher(idx);
        }
        Disposition::Exit | Disposition::Forward => {
            rt.fatal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ty: ExceptionType) -> ExceptionInfo {
        ExceptionInfo {
            ty,
            extra: 0,
            task: ObjectId::INVALID,
            worker: None,
            fault_addr: None,
        }
    }

    #[test]
    fn first_non_forward_wins() {
        let chain = ExceptionChain::new();
        chain.register(|_| Disposition::Forward).unwrap();
        chain.register(|i| {
            if matches!(i.ty, ExceptionType::User(7)) {
                Disposition::Continue
            } else {
                Disposition::Forward
            }
        })
        .unwrap();
        chain.register(|_| Disposition::KillTask).unwrap();

        assert_eq!(
            chain.walk(&info(ExceptionType::User(7))),
            Some(Disposition::Continue)
        );
        assert_eq!(
            chain.walk(&info(ExceptionType::Segfault)),
            Some(Disposition::KillTask)
        );
    }

    #[test]
    fn all_forward_falls_to_default() {
        let chain = ExceptionChain::new();
        chain.register(|_| Disposition::Forward).unwrap();
        assert_eq!(chain.walk(&info(ExceptionType::Panic)), None);
        assert_eq!(default_disposition(ExceptionType::Panic), Disposition::KillTask);
        assert_eq!(
            default_disposition(ExceptionType::User(0)),
            Disposition::Continue
        );
        assert_eq!(
            default_disposition(ExceptionType::Internal),
            Disposition::Exit
        );
    }

    #[test]
    fn chain_capacity_bounded() {
        let chain = ExceptionChain::new();
        for _ in 0..MAX_HANDLERS {
            chain.register(|_| Disposition::Forward).unwrap();
        }
        assert_eq!(
            chain.register(|_| Disposition::Forward),
            Err(ErrorCode::OutOfMemory)
        );
    }
}
