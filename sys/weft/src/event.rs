// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot events: the single primitive behind every blocking wait.
//!
//! A task entering a blocking call creates one event and hands a reference
//! to each potential wake source (message arrival, semaphore post, timer,
//! kill). The first source to fire wins the ARMED -> SIGNALED transition
//! and is the one obligated to make the owner runnable; every later source
//! learns it lost and backs off. The reference count is the `Arc` itself:
//! cancelling a registration is dropping a clone, and the event is freed
//! when the last clone goes.
//!
//! The waiter/signal interleaving is resolved by the event: a signal that
//! lands before the waiter has actually blocked still wins the transition,
//! and the resulting `ready` call is a no-op against a task that is not
//! blocked. That, plus the waiter re-checking the event after marking
//! itself blocked, closes the lost-wakeup window. Both sides use `SeqCst`
//! for exactly that reason.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use abi::{EventSource, ObjectId};

use crate::startup::Runtime;

const ARMED: u32 = 0;
const SIGNALED: u32 = 1;

fn encode(src: EventSource) -> u32 {
    let s = match src {
        EventSource::Msg => 1,
        EventSource::Sem => 2,
        EventSource::Timer => 3,
        EventSource::Kill => 4,
        EventSource::User => 5,
    };
    SIGNALED | s << 8
}

fn decode(word: u32) -> Option<EventSource> {
    if word & SIGNALED == 0 {
        return None;
    }
    Some(match word >> 8 {
        1 => EventSource::Msg,
        2 => EventSource::Sem,
        3 => EventSource::Timer,
        4 => EventSource::Kill,
        _ => EventSource::User,
    })
}

/// Outcome of a signal attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignalOutcome {
    /// This call won the transition; the caller owns waking the task.
    FirstSignal,
    /// Someone else already fired the event.
    AlreadySignaled,
}

/// See the module docs. State and source share one word so that the
/// winning source can never be overwritten by a losing one.
#[derive(Debug)]
pub struct Event {
    word: AtomicU32,
    owner: AtomicU32,
}

impl Event {
    /// Creates an armed event owned by `owner` (the task that will block on
    /// it). One `Arc` clone per signal source, plus the waiter's own.
    pub fn new(owner: ObjectId) -> Arc<Event> {
        Arc::new(Event {
            word: AtomicU32::new(ARMED),
            owner: AtomicU32::new(owner.0),
        })
    }

    /// Attempts the one-way ARMED -> SIGNALED transition, recording which
    /// source fired.
    pub fn signal(&self, src: EventSource) -> SignalOutcome {
        match self.word.compare_exchange(
            ARMED,
            encode(src),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => SignalOutcome::FirstSignal,
            Err(_) => SignalOutcome::AlreadySignaled,
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.word.load(Ordering::SeqCst) & SIGNALED != 0
    }

    /// The source that won, once signaled.
    pub fn source(&self) -> Option<EventSource> {
        decode(self.word.load(Ordering::SeqCst))
    }

    /// Detaches the owner without signaling: a later winner finds nobody to
    /// wake.
    pub fn cancel(&self) {
        self.owner.store(ObjectId::INVALID.0, Ordering::SeqCst);
    }

    pub fn owner(&self) -> ObjectId {
        ObjectId(self.owner.load(Ordering::SeqCst))
    }
}

/// Signals `ev` from `src` and, on winning, moves the owner task from
/// blocked to ready through its scheduler. This is the call every wake
/// source uses.
pub fn fire(rt: &Runtime, ev: &Event, src: EventSource) -> SignalOutcome {
    let outcome = ev.signal(src);
    if outcome == SignalOutcome::FirstSignal {
        let owner = ev.owner();
        if !owner.is_invalid() {
            crate::task::make_ready(rt, owner);
        }
    }
    outcome
}
