// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal plumbing.
//!
//! Two classes of signal reach the runtime:
//!
//! - the **preemption signal** (`SIGURG`), sent with `pthread_kill` to a
//!   specific worker; its handler only records a pending-reschedule flag and
//!   returns, so the handler body is trivially async-signal-safe;
//! - the **fault signals** (`SIGSEGV`/`SIGBUS`/`SIGILL`/`SIGFPE`), which are
//!   routed into the exception chain. Fault handlers run on a per-worker
//!   alternate stack because the interesting SIGSEGV -- a task walking into
//!   its guard page -- arrives precisely when the task stack is unusable.
//!
//! Handlers are installed once at runtime start and restored to `SIG_DFL`
//! at shutdown.

use core::mem;
use core::ptr;

use abi::ErrorCode;

/// Signal used to interrupt a worker for rescheduling.
pub const PREEMPT_SIGNAL: libc::c_int = libc::SIGURG;

const FAULT_SIGNALS: [libc::c_int; 4] =
    [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];

extern "C" fn preempt_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    crate::worker::note_preempt_signal();
}

extern "C" fn fault_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // Safety: the kernel hands us a valid siginfo for these signals.
    let (code, addr) = unsafe { ((*info).si_code, (*info).si_addr() as usize) };
    crate::fault::on_fault_signal(sig, code, addr);
}

/// Installs the runtime's process-wide handlers.
pub fn install() -> Result<(), ErrorCode> {
    unsafe {
        set_handler(PREEMPT_SIGNAL, preempt_handler, libc::SA_RESTART)?;
        for sig in FAULT_SIGNALS {
            set_handler(
                sig,
                fault_handler,
                libc::SA_ONSTACK | libc::SA_NODEFER,
            )?;
        }
    }
    Ok(())
}

/// Restores default dispositions. Called after all workers have stopped.
pub fn uninstall() {
    unsafe {
        for sig in core::iter::once(PREEMPT_SIGNAL).chain(FAULT_SIGNALS) {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(sig, &sa, ptr::null_mut());
        }
    }
}

/// Reinstates the default disposition for `sig` and lets the kernel
/// redeliver it. Used when a fault arrives somewhere the runtime cannot
/// recover (no current task): the process dies with the honest signal
/// status instead of a disguised one.
pub fn die_by_default_disposition(sig: libc::c_int) -> ! {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &sa, ptr::null_mut());
        libc::raise(sig);
        // If the raise somehow returns, give up less gracefully.
        libc::_exit(128 + sig);
    }
}

unsafe fn set_handler(
    sig: libc::c_int,
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
    extra_flags: libc::c_int,
) -> Result<(), ErrorCode> {
    let mut sa: libc::sigaction = mem::zeroed();
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_SIGINFO | extra_flags;
    libc::sigemptyset(&mut sa.sa_mask);
    if libc::sigaction(sig, &sa, ptr::null_mut()) != 0 {
        return Err(ErrorCode::PlatformError);
    }
    Ok(())
}

/// Delivers the preemption signal to a specific worker thread.
pub fn interrupt_thread(thread: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(thread, PREEMPT_SIGNAL);
    }
}

/// A per-thread alternate signal stack, armed while the owning worker is
/// alive. Dropping it disarms the alternate stack before the memory goes
/// away.
pub struct AltStack {
    mem: Box<[u8]>,
}

impl AltStack {
    pub fn install() -> Self {
        let len = 8 * libc::SIGSTKSZ.max(libc::MINSIGSTKSZ);
        let mem = vec![0u8; len].into_boxed_slice();
        let ss = libc::stack_t {
            ss_sp: mem.as_ptr() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: len,
        };
        // Safety: the memory outlives the registration; Drop disarms it.
        unsafe {
            libc::sigaltstack(&ss, ptr::null_mut());
        }
        AltStack { mem }
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let ss = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: self.mem.len(),
        };
        unsafe {
            libc::sigaltstack(&ss, ptr::null_mut());
        }
    }
}
