// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MPMC linked ring.
//!
//! A singly linked FIFO whose nodes live in a [`Pool`], linked by pool
//! handle rather than pointer; every traversal step locks the node it is
//! about to inspect, so a node freed by a racing consumer is detected as a
//! dead handle instead of dereferenced. Lock-free, not wait-free.
//!
//! Claiming is a `consumed` flag swap: exactly one popper wins each node.
//! The winner unlinks the node from `head` and owns it; losers help swing
//! `head` forward past consumed nodes. A consumed node whose `next` link is
//! not published yet makes `pop` return `None` rather than spin -- liveness
//! is deliberately yielded to the producer mid-push.
//!
//! This is the structure behind the runtime log: pushes must be callable
//! from signal handlers, so nothing here blocks or allocates beyond the
//! pool slot.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{ErrorCode, ObjectId};

use crate::pool::{Pool, PoolGuard};

struct Node<T> {
    /// Raw `ObjectId` bits of the successor; 0 (the invalid id) terminates.
    next: AtomicU32,
    consumed: AtomicBool,
    payload: T,
}

/// The ring itself: a node pool plus head/tail handles.
pub struct Ring<T> {
    pool: Pool<Node<T>>,
    head: AtomicU32,
    tail: AtomicU32,
}

const NIL: u32 = 0;

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Ring {
            pool: Pool::new(capacity),
            head: AtomicU32::new(NIL),
            tail: AtomicU32::new(NIL),
        }
    }

    /// Appends `payload`. Fails with `OutOfMemory` when the node pool is
    /// exhausted (callers count overflow; see the log).
    pub fn push(&self, payload: T) -> Result<(), ErrorCode> {
        let id = self.pool.alloc(Node {
            next: AtomicU32::new(NIL),
            consumed: AtomicBool::new(false),
            payload,
        })?;
        self.pool.lock_first(id);
        // The pool reference now belongs to the ring; the winning popper
        // inherits it. Drop the allocation lock so the final unlock can
        // free the slot.
        self.pool.unlock(id);

        loop {
            let tail_bits = self.tail.load(Ordering::Acquire);
            if tail_bits == NIL {
                // Empty ring: install ourselves as both ends.
                if self
                    .tail
                    .compare_exchange(NIL, id.0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.head.compare_exchange(
                        NIL,
                        id.0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Ok(());
                }
                continue;
            }

            let tail_id = ObjectId(tail_bits);
            let Some(tail_node) = self.pool.lock(tail_id) else {
                // The tail node was consumed and freed before anything was
                // linked after it; every node is gone, so head is (or is
                // about to be) invalid. Replace the stale tail.
                if self
                    .tail
                    .compare_exchange(tail_bits, id.0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.head.compare_exchange(
                        NIL,
                        id.0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Ok(());
                }
                continue;
            };

            match tail_node.next.compare_exchange(
                NIL,
                id.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.tail.compare_exchange(
                        tail_bits,
                        id.0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    // If a popper emptied the ring while we linked onto its
                    // last node, head went invalid; point it at us.
                    if self.head.load(Ordering::Acquire) == NIL {
                        let _ = self.head.compare_exchange(
                            NIL,
                            id.0,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    return Ok(());
                }
                Err(actual_next) => {
                    // Someone beat us; help swing the tail forward and retry
                    // from the new tail.
                    let _ = self.tail.compare_exchange(
                        tail_bits,
                        actual_next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        }
    }

    /// Claims and returns the oldest unconsumed node, or `None` if the ring
    /// is empty at observation -- including the case of a consumed head
    /// whose successor link has not been published yet (producer liveness
    /// policy).
    pub fn pop(&self) -> Option<Popped<'_, T>> {
        loop {
            let head_bits = self.head.load(Ordering::Acquire);
            if head_bits == NIL {
                return None;
            }
            let head_id = ObjectId(head_bits);
            let Some(node) = self.pool.lock(head_id) else {
                // Freed under us; its claimer already moved head.
                core::hint::spin_loop();
                continue;
            };

            if !node.consumed.swap(true, Ordering::AcqRel) {
                // Ours. Unlink from head before handing it out, so the slot
                // can be freed without ever being reachable.
                let next = node.next.load(Ordering::Acquire);
                if next != NIL {
                    let _ = self.head.compare_exchange(
                        head_bits,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                } else {
                    let _ = self.head.compare_exchange(
                        head_bits,
                        NIL,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    // A producer may have linked behind our back between the
                    // `next` read and the CAS; re-check and repair so the
                    // new node is not stranded.
                    let relinked = node.next.load(Ordering::Acquire);
                    if relinked != NIL {
                        let _ = self.head.compare_exchange(
                            NIL,
                            relinked,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                }
                return Some(Popped {
                    ring: self,
                    id: head_id,
                    guard: Some(node),
                });
            }

            // Already claimed by another popper.
            let next = node.next.load(Ordering::Acquire);
            if next == NIL {
                // Consumed, but its push (or successor push) hasn't linked
                // yet: report empty instead of spinning on the producer.
                return None;
            }
            let _ = self.head.compare_exchange(
                head_bits,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

/// A node claimed by [`Ring::pop`]. Dereferences to the payload; dropping
/// it releases the node's slot back to the pool.
pub struct Popped<'a, T> {
    ring: &'a Ring<T>,
    id: ObjectId,
    guard: Option<PoolGuard<'a, Node<T>>>,
}

impl<'a, T> core::ops::Deref for Popped<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.as_ref().unwrap().payload
    }
}

impl<'a, T> Drop for Popped<'a, T> {
    fn drop(&mut self) {
        // Retire first so the final unlock (ours, or a helper's transient
        // lock) runs the slot destructor.
        self.ring.pool.retire(self.id);
        drop(self.guard.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn empty_pop_is_none() {
        let ring: Ring<u32> = Ring::new(8);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn fifo_order_single_thread() {
        let ring: Ring<u32> = Ring::new(8);
        for i in 0..5 {
            ring.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(*ring.pop().unwrap(), i);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn capacity_exhaustion_and_reuse() {
        let ring: Ring<u32> = Ring::new(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(ErrorCode::OutOfMemory));
        assert_eq!(*ring.pop().unwrap(), 0);
        // Slot returns once the popped node drops.
        ring.push(100).unwrap();
    }

    #[test]
    fn drain_then_refill() {
        let ring: Ring<u32> = Ring::new(8);
        for round in 0..10 {
            ring.push(round).unwrap();
            ring.push(round + 100).unwrap();
            assert_eq!(*ring.pop().unwrap(), round);
            assert_eq!(*ring.pop().unwrap(), round + 100);
            assert!(ring.pop().is_none());
        }
    }

    #[test]
    fn mpmc_each_push_popped_exactly_once() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        use std::sync::atomic::{AtomicBool, Ordering};

        let ring: Arc<Ring<u64>> = Arc::new(Ring::new(1024));
        let producers_done = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let v = (p * PER_PRODUCER + i) as u64;
                    // Bounded ring: spin on overflow.
                    while ring.push(v).is_err() {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let seen: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ring = ring.clone();
                let producers_done = producers_done.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match ring.pop() {
                            Some(v) => got.push(*v),
                            None => {
                                // Only authoritative once the producers have
                                // finished; before that, empty is transient.
                                if producers_done.load(Ordering::SeqCst) {
                                    match ring.pop() {
                                        Some(v) => got.push(*v),
                                        None => break,
                                    }
                                } else {
                                    std::thread::yield_now();
                                }
                            }
                        }
                    }
                    got
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        producers_done.store(true, Ordering::SeqCst);

        let mut counts: HashMap<u64, usize> = HashMap::new();
        for h in seen {
            for v in h.join().unwrap() {
                *counts.entry(v).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), PRODUCERS * PER_PRODUCER);
        assert!(counts.values().all(|&c| c == 1), "duplicate pop");
    }
}
