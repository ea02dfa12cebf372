// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Futex-backed worker parking.
//!
//! Workers park when their scheduler has nothing runnable and are unparked
//! by `ready` notifications, ticks, and shutdown. The futex word and the
//! operations on it are async-signal-safe, so an unpark can come from
//! anywhere the runtime might want to wake a worker.

use core::sync::atomic::{AtomicU32, Ordering};

const IDLE: u32 = 0;
const NOTIFIED: u32 = 1;

/// A one-shot permit: `unpark` stores a token, `park` consumes it or sleeps
/// until one arrives. Multiple unparks coalesce.
#[derive(Debug)]
pub struct Parker {
    state: AtomicU32,
}

impl Parker {
    pub const fn new() -> Self {
        Parker {
            state: AtomicU32::new(IDLE),
        }
    }

    /// Blocks until a token is available, then consumes it.
    pub fn park(&self) {
        loop {
            if self.state.swap(IDLE, Ordering::Acquire) == NOTIFIED {
                return;
            }
            // Sleeps only while the word is still IDLE; wakeups and EINTR
            // both fall through to the re-check above.
            futex_wait(&self.state, IDLE);
        }
    }

    /// Deposits a token, waking the parked thread if there is one.
    pub fn unpark(&self) {
        if self.state.swap(NOTIFIED, Ordering::Release) == IDLE {
            futex_wake(&self.state, 1);
        }
    }
}

fn futex_wait(word: &AtomicU32, expected: u32) {
    // Safety: the word outlives the call; FUTEX_WAIT with a null timeout
    // blocks until woken or signalled.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

fn futex_wake(word: &AtomicU32, n: i32) {
    // Safety: wakes at most `n` waiters on our own word.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unpark_before_park_does_not_block() {
        let p = Parker::new();
        p.unpark();
        p.park();
    }

    #[test]
    fn unpark_wakes_parked_thread() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let t = std::thread::spawn(move || p2.park());
        std::thread::sleep(std::time::Duration::from_millis(20));
        p.unpark();
        t.join().unwrap();
    }
}
