// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task stack mappings.

use abi::ErrorCode;

/// One task's private stack: an anonymous mapping whose lowest page is a
/// `PROT_NONE` guard. Anonymous memory is committed lazily by the OS, so the
/// reservation costs address space, not RAM, until the task actually grows
/// into it.
#[derive(Debug)]
pub struct TaskStack {
    base: *mut u8,
    len: usize,
    guard: usize,
}

// The mapping is plain memory; the raw pointer is just its address.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    /// Maps a stack of `len` bytes (which must be page-aligned and larger
    /// than one page) and arms the guard page.
    pub fn map(len: usize) -> Result<Self, ErrorCode> {
        let guard = page_size();
        if len <= guard || len % guard != 0 {
            return Err(ErrorCode::InvalidState);
        }
        // Safety: anonymous mapping, no fd, no fixed address.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ErrorCode::OutOfMemory);
        }
        let base = base as *mut u8;
        // Safety: `base` is ours and page-aligned; revoking access to the
        // low page turns overruns into SIGSEGV instead of silent corruption.
        let rc = unsafe { libc::mprotect(base as *mut _, guard, libc::PROT_NONE) };
        if rc != 0 {
            unsafe {
                libc::munmap(base as *mut _, len);
            }
            return Err(ErrorCode::PlatformError);
        }
        Ok(TaskStack { base, len, guard })
    }

    /// One-past-the-end address; stacks grow down from here.
    pub fn top(&self) -> usize {
        self.base as usize + self.len
    }

    /// Whether `addr` falls inside the guard page. Used to classify a
    /// SIGSEGV as a stack overflow.
    pub fn guard_contains(&self, addr: usize) -> bool {
        let b = self.base as usize;
        addr >= b && addr < b + self.guard
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        // Safety: we mapped exactly this range in `map`.
        unsafe {
            libc::munmap(self.base as *mut _, self.len);
        }
    }
}

/// Cached system page size.
pub fn page_size() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};
    static PAGE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE.store(sz, Ordering::Relaxed);
    sz
}
