// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! Waiters queue FIFO; a post hands its token directly to the head waiter
//! by firing that waiter's event with the `Sem` source, so the count never
//! bounces through an intermediate state a barger could steal. If the
//! waiter's event was already fired by its timer (or a kill), the post
//! retries with the next waiter -- the token is never lost.

use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

use abi::{ErrorCode, EventSource, ObjectId};

use crate::event::{self, Event, SignalOutcome};
use crate::startup::Runtime;
use crate::task;
use crate::worker;

pub(crate) struct SemObj {
    name: String,
    inner: spin::Mutex<SemInner>,
}

struct SemInner {
    count: u32,
    waiters: VecDeque<Arc<Event>>,
}

impl SemObj {
    fn new(name: String, initial: u32) -> SemObj {
        SemObj {
            name,
            inner: spin::Mutex::new(SemInner {
                count: initial,
                waiters: VecDeque::new(),
            }),
        }
    }
}

impl crate::dir::Object for SemObj {
    fn kind(&self) -> &'static str {
        "sem"
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            out,
            "{} count={} waiters={}",
            self.name,
            inner.count,
            inner.waiters.len()
        )
    }

    fn on_destroy(&self) {
        // Unblock everyone; they will observe the semaphore is gone.
        let waiters: Vec<_> = self.inner.lock().waiters.drain(..).collect();
        if let Some(rt) = crate::startup::active() {
            for ev in waiters {
                event::fire(rt, &ev, EventSource::User);
            }
        }
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

impl Runtime {
    /// Creates a semaphore with the given starting count.
    pub fn sem_create(&self, name: &str, initial: u32) -> Result<ObjectId, ErrorCode> {
        if name.is_empty() || name.len() > crate::config::NAME_LEN {
            return Err(ErrorCode::InvalidState);
        }
        self.dir()
            .insert(Box::new(SemObj::new(name.to_owned(), initial)))
    }

    /// Releases one token: either hands it to the oldest live waiter or
    /// bumps the count.
    pub fn sem_post(&self, sem: ObjectId) -> Result<(), ErrorCode> {
        let Some(s) = self.dir().find_as::<SemObj>(sem) else {
            return Err(ErrorCode::NotFound);
        };
        loop {
            let next_waiter = {
                let mut inner = s.inner.lock();
                match inner.waiters.pop_front() {
                    Some(ev) => Some(ev),
                    None => {
                        inner.count += 1;
                        None
                    }
                }
            };
            let Some(ev) = next_waiter else {
                return Ok(());
            };
            // Outside the lock: firing walks into the scheduler.
            if event::fire(self, &ev, EventSource::Sem) == SignalOutcome::FirstSignal {
                return Ok(());
            }
            // That waiter already timed out or was killed; its token goes
            // to the next one.
        }
    }

    /// Takes a token without blocking; `Empty` if none available.
    pub fn sem_try_wait(&self, sem: ObjectId) -> Result<(), ErrorCode> {
        let Some(s) = self.dir().find_as::<SemObj>(sem) else {
            return Err(ErrorCode::NotFound);
        };
        let mut inner = s.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            Ok(())
        } else {
            Err(ErrorCode::Empty)
        }
    }

    /// Takes a token, blocking until one is posted. `timeout` in ticks;
    /// `Timeout` on expiry.
    pub fn sem_wait(&self, sem: ObjectId, timeout: Option<u64>) -> Result<(), ErrorCode> {
        let Some(me) = worker::current_task() else {
            return Err(ErrorCode::InvalidState);
        };
        task::unwind_if_killed(me);
        let deadline = timeout.map(|t| self.now().saturating_add(t));

        loop {
            let ev = {
                let Some(s) = self.dir().find_as::<SemObj>(sem) else {
                    return Err(ErrorCode::NotFound);
                };
                let mut inner = s.inner.lock();
                if inner.count > 0 {
                    inner.count -= 1;
                    return Ok(());
                }
                let now = self.now();
                if let Some(d) = deadline {
                    if now >= d {
                        return Err(ErrorCode::Timeout);
                    }
                }
                let ev = Event::new(me.id());
                inner.waiters.push_back(ev.clone());
                ev
            };

            let timer_handle = deadline.map(|d| {
                let now = self.now();
                self.timer()
                    .queue(now, d.saturating_sub(now).max(1), ev.clone(), EventSource::Timer)
            });

            let src = task::block_current(self, &ev);

            // Drop our registration if the post didn't already take it.
            if let Some(s) = self.dir().find_as::<SemObj>(sem) {
                s.inner
                    .lock()
                    .waiters
                    .retain(|w| !Arc::ptr_eq(w, &ev));
            }
            if let Some(h) = timer_handle {
                if src != EventSource::Timer {
                    self.timer().cancel(&h);
                }
            }

            match src {
                // Token handed over by the post.
                EventSource::Sem => return Ok(()),
                EventSource::Kill => {
                    task::unwind_if_killed(me);
                }
                // Timer: loop re-checks, sees the deadline, returns Timeout
                // (or wins a token that arrived in the same instant).
                // User: semaphore destroyed under us; loop reports NotFound.
                _ => {}
            }
        }
    }

    /// Current token count (diagnostic; racy by nature).
    pub fn sem_value(&self, sem: ObjectId) -> Result<u32, ErrorCode> {
        let Some(s) = self.dir().find_as::<SemObj>(sem) else {
            return Err(ErrorCode::NotFound);
        };
        let v = s.inner.lock().count;
        Ok(v)
    }
}
