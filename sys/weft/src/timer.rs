// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deadline timers.
//!
//! Entries are keyed `(deadline, seq)` in an ordered map so expiry is a
//! prefix split; the sequence number keeps same-tick entries distinct and
//! FIFO. The clock thread owns advancing time and calls [`TimerWheel::tick`]
//! once per system tick; any thread may queue or cancel, guarded by the
//! wheel's short spinlock. Events are fired after the lock is dropped --
//! firing walks into scheduler locks, and nesting those under the wheel
//! lock would invert with `queue` callers.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use abi::EventSource;

use crate::event::{self, Event};
use crate::startup::Runtime;

struct TimerEntry {
    event: Arc<Event>,
    source: EventSource,
}

/// Cancellation handle for a queued entry.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    key: (u64, u64),
}

pub(crate) struct TimerWheel {
    entries: spin::Mutex<BTreeMap<(u64, u64), TimerEntry>>,
    seq: AtomicU64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        TimerWheel {
            entries: spin::Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Queues `event` to be fired with `source` at `now + ticks`.
    pub(crate) fn queue(
        &self,
        now: u64,
        ticks: u64,
        event: Arc<Event>,
        source: EventSource,
    ) -> TimerHandle {
        let key = (
            now.saturating_add(ticks),
            self.seq.fetch_add(1, Ordering::Relaxed),
        );
        self.entries
            .lock()
            .insert(key, TimerEntry { event, source });
        TimerHandle { key }
    }

    /// Removes a queued entry, dropping its event reference. Returns false
    /// if it already fired (or was already cancelled).
    pub(crate) fn cancel(&self, handle: &TimerHandle) -> bool {
        self.entries.lock().remove(&handle.key).is_some()
    }

    /// Fires every entry with a deadline at or before `now`.
    pub(crate) fn tick(&self, rt: &Runtime, now: u64) {
        let expired = {
            let mut entries = self.entries.lock();
            let later = entries.split_off(&(now + 1, 0));
            core::mem::replace(&mut *entries, later)
        };
        for (_, entry) in expired {
            event::fire(rt, &entry.event, entry.source);
            // Entry drops here, releasing its event reference.
        }
    }

    /// Drops all entries without firing. Shutdown path.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::ObjectId;

    // Firing without a live runtime: exercised through Event directly by
    // giving the wheel events with no owner (fire() skips the wake).

    #[test]
    fn cancel_before_expiry_leaves_event_armed() {
        let wheel = TimerWheel::new();
        let ev = Event::new(ObjectId::INVALID);
        let h = wheel.queue(100, 10, ev.clone(), EventSource::Timer);
        assert!(wheel.cancel(&h));
        assert!(!ev.is_signaled(), "cancelled timer must not signal");
        assert!(!wheel.cancel(&h), "double cancel reports gone");
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn same_tick_entries_are_distinct() {
        let wheel = TimerWheel::new();
        let a = Event::new(ObjectId::INVALID);
        let b = Event::new(ObjectId::INVALID);
        let ha = wheel.queue(0, 5, a, EventSource::Timer);
        let hb = wheel.queue(0, 5, b, EventSource::Timer);
        assert_ne!(ha.key, hb.key);
        assert!(wheel.cancel(&ha));
        assert!(wheel.cancel(&hb));
    }
}
