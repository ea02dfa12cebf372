// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Context switching for x86_64 System V.
//!
//! A switch only ever happens at a call site the outgoing context chose (a
//! yield, a block, or the dispatcher resuming a task), so the caller-saved
//! half of the register file is dead by ABI and we save exactly the
//! callee-saved registers plus the stack pointer. Preemption never switches
//! from the signal handler itself -- the handler records a pending flag and
//! the switch happens at the next safe point -- which is what makes this
//! small save set sufficient.
//!
//! A brand-new context is staged so that the first switch into it `ret`s
//! into [`weft_task_trampoline`], which moves the task pointer parked in
//! `r12` into the first argument register and calls `weft_task_main` (defined
//! in `worker.rs`). The trampoline enters `weft_task_main` with the stack
//! alignment the ABI demands at a function entry.

use core::arch::global_asm;

/// Callee-saved machine state of a suspended context.
///
/// Field order is load-bearing: the assembly below addresses this struct by
/// fixed offsets.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Context {
    /// All-zero context, for static storage. Never resumed as-is; real
    /// contents come from a switch save or [`prepare`].
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

global_asm!(
    "
    .text
    .globl weft_context_switch
    .p2align 4
weft_context_switch:
    mov [rdi + 0x00], rsp
    mov [rdi + 0x08], rbp
    mov [rdi + 0x10], rbx
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15
    mov rsp, [rsi + 0x00]
    mov rbp, [rsi + 0x08]
    mov rbx, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov r13, [rsi + 0x20]
    mov r14, [rsi + 0x28]
    mov r15, [rsi + 0x30]
    ret

    .globl weft_context_restore
    .p2align 4
weft_context_restore:
    mov rsp, [rdi + 0x00]
    mov rbp, [rdi + 0x08]
    mov rbx, [rdi + 0x10]
    mov r12, [rdi + 0x18]
    mov r13, [rdi + 0x20]
    mov r14, [rdi + 0x28]
    mov r15, [rdi + 0x30]
    ret

    .globl weft_task_trampoline
    .p2align 4
weft_task_trampoline:
    mov rdi, r12
    xor ebp, ebp
    and rsp, -16
    call weft_task_main
    ud2
    "
);

extern "C" {
    /// Saves the current context into `save` and resumes `restore`. Returns
    /// when something later switches back into `save`.
    ///
    /// Safety: both pointers must reference valid `Context` storage, and
    /// `restore` must hold either a context previously captured by this
    /// function or one staged by [`prepare`].
    pub fn weft_context_switch(save: *mut Context, restore: *const Context);

    /// One-way variant: installs `restore` without saving anything. Used to
    /// abandon a context that will never run again (fault handling).
    ///
    /// Safety: as for `weft_context_switch`; the current context is lost.
    pub fn weft_context_restore(restore: *const Context) -> !;

    fn weft_task_trampoline();
}

/// Stages `ctx` so its first resumption enters `weft_task_main(task)` on the
/// given stack.
///
/// Safety: `stack_top` must be the one-past-the-end address of a mapped,
/// writable stack region with room for at least one pointer below it.
pub unsafe fn prepare(ctx: &mut Context, stack_top: usize, task: *mut u8) {
    // Place the trampoline's return address so that `ret` leaves rsp
    // 16-aligned, as the trampoline's `call` expects.
    let top = stack_top & !15;
    let sp = top - 8;
    (sp as *mut u64).write(weft_task_trampoline as usize as u64);

    *ctx = Context {
        rsp: sp as u64,
        r12: task as u64,
        ..Context::default()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_matches_asm_offsets() {
        // The asm addresses fields by offset; pin the layout here.
        assert_eq!(core::mem::size_of::<Context>(), 7 * 8);
        let c = Context::default();
        let base = &c as *const Context as usize;
        assert_eq!(&c.rsp as *const u64 as usize - base, 0x00);
        assert_eq!(&c.r15 as *const u64 as usize - base, 0x30);
    }
}
