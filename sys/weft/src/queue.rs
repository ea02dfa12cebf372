// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MPSC intrusive queue.
//!
//! Producers enqueue with a single CAS on the shared inbox; everything else
//! belongs to the single consumer. The consumer periodically grabs the whole
//! inbox (one swap), fixes up `prev` pointers while reversing it into its
//! private doubly linked list, and from then on can scan and remove nodes at
//! arbitrary positions in O(1) without ever racing a producer. Removal by
//! anyone but the owner is forbidden by construction: the private list is
//! only reachable through `&mut`-discipline consumer calls.
//!
//! Nodes are intrusive: the containing type embeds a [`Link`] and the queue
//! never allocates.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Embedded linkage. `next` doubles as the producer-side stack link and the
/// consumer-side forward link; `prev` is consumer-private and fixed up
/// lazily when the inbox is drained.
#[derive(Debug)]
pub struct Link<T> {
    next: AtomicPtr<T>,
    prev: Cell<*mut T>,
}

impl<T> Link<T> {
    pub const fn new() -> Self {
        Link {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: Cell::new(ptr::null_mut()),
        }
    }
}

/// Implemented by types that embed a [`Link`] to themselves.
///
/// # Safety
///
/// `link` must return the same embedded link for the lifetime of the value,
/// and a node may be on at most one queue at a time.
pub unsafe trait Intrusive: Sized {
    fn link(&self) -> &Link<Self>;
}

/// The queue: a producer-shared inbox plus the consumer's private list.
pub struct MpscQueue<T: Intrusive> {
    /// LIFO stack of freshly pushed nodes, shared with producers.
    inbox: AtomicPtr<T>,
    /// Consumer-private FIFO ends. Only the owning consumer may touch these,
    /// which is what the `unsafe` on the consumer methods enforces.
    head: Cell<*mut T>,
    tail: Cell<*mut T>,
}

// Producers only touch `inbox`; the Cells are governed by the single-
// consumer contract on the unsafe methods below.
unsafe impl<T: Intrusive + Send> Send for MpscQueue<T> {}
unsafe impl<T: Intrusive + Send> Sync for MpscQueue<T> {}

impl<T: Intrusive> MpscQueue<T> {
    pub const fn new() -> Self {
        MpscQueue {
            inbox: AtomicPtr::new(ptr::null_mut()),
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    /// Producer side: enqueues an owned node. May be called from any thread.
    ///
    /// Safety: caller transfers ownership of `node`; the pointee must stay
    /// valid until the consumer removes it.
    pub unsafe fn push(&self, node: *mut T) {
        let link = (*node).link();
        loop {
            let cur = self.inbox.load(Ordering::Relaxed);
            link.next.store(cur, Ordering::Relaxed);
            if self
                .inbox
                .compare_exchange_weak(cur, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Consumer side: moves everything from the inbox into the private
    /// list, oldest first, fixing up `prev` pointers along the way.
    ///
    /// Safety: single-consumer only.
    pub unsafe fn drain_inbox(&self) {
        let mut stack = self.inbox.swap(ptr::null_mut(), Ordering::Acquire);
        // The stack is newest-first; reversing restores push order.
        let mut oldest_first: *mut T = ptr::null_mut();
        while !stack.is_null() {
            let next = (*stack).link().next.load(Ordering::Relaxed);
            (*stack).link().next.store(oldest_first, Ordering::Relaxed);
            oldest_first = stack;
            stack = next;
        }
        while !oldest_first.is_null() {
            let next = (*oldest_first).link().next.load(Ordering::Relaxed);
            self.append(oldest_first);
            oldest_first = next;
        }
    }

    unsafe fn append(&self, node: *mut T) {
        let link = (*node).link();
        link.next.store(ptr::null_mut(), Ordering::Relaxed);
        link.prev.set(self.tail.get());
        if self.tail.get().is_null() {
            self.head.set(node);
        } else {
            (*self.tail.get()).link().next.store(node, Ordering::Relaxed);
        }
        self.tail.set(node);
    }

    /// Consumer side: oldest node in the private list, if any. Does not
    /// drain the inbox first; callers decide when to pay for that.
    ///
    /// Safety: single-consumer only.
    pub unsafe fn front(&self) -> *mut T {
        self.head.get()
    }

    /// Consumer side: successor of `node` within the private list.
    ///
    /// Safety: single-consumer only; `node` must be on this queue's private
    /// list.
    pub unsafe fn next(&self, node: *mut T) -> *mut T {
        (*node).link().next.load(Ordering::Relaxed)
    }

    /// Consumer side: unlinks `node` from the private list in O(1) and
    /// returns ownership to the caller.
    ///
    /// Safety: single-consumer only; `node` must be on this queue's private
    /// list.
    pub unsafe fn remove(&self, node: *mut T) {
        let link = (*node).link();
        let prev = link.prev.get();
        let next = link.next.load(Ordering::Relaxed);
        if prev.is_null() {
            self.head.set(next);
        } else {
            (*prev).link().next.store(next, Ordering::Relaxed);
        }
        if next.is_null() {
            self.tail.set(prev);
        } else {
            (*next).link().prev.set(prev);
        }
        link.next.store(ptr::null_mut(), Ordering::Relaxed);
        link.prev.set(ptr::null_mut());
    }

    /// Consumer side: drains the inbox and pops the oldest node.
    ///
    /// Safety: single-consumer only.
    pub unsafe fn pop_front(&self) -> *mut T {
        self.drain_inbox();
        let node = self.head.get();
        if !node.is_null() {
            self.remove(node);
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct TestNode {
        link: Link<TestNode>,
        value: u64,
    }

    unsafe impl Intrusive for TestNode {
        fn link(&self) -> &Link<TestNode> {
            &self.link
        }
    }

    fn node(value: u64) -> *mut TestNode {
        Box::into_raw(Box::new(TestNode {
            link: Link::new(),
            value,
        }))
    }

    unsafe fn take(p: *mut TestNode) -> u64 {
        let b = Box::from_raw(p);
        b.value
    }

    #[test]
    fn fifo_through_inbox() {
        let q: MpscQueue<TestNode> = MpscQueue::new();
        unsafe {
            for i in 0..5 {
                q.push(node(i));
            }
            for i in 0..5 {
                let p = q.pop_front();
                assert_eq!(take(p), i);
            }
            assert!(q.pop_front().is_null());
        }
    }

    #[test]
    fn remove_from_middle() {
        let q: MpscQueue<TestNode> = MpscQueue::new();
        unsafe {
            let ptrs: Vec<_> = (0..5).map(|i| node(i)).collect();
            for &p in &ptrs {
                q.push(p);
            }
            q.drain_inbox();
            // Unlink the middle node directly.
            q.remove(ptrs[2]);
            assert_eq!(take(ptrs[2]), 2);
            let order: Vec<u64> = (0..4)
                .map(|_| take(q.pop_front()))
                .collect();
            assert_eq!(order, [0, 1, 3, 4]);
        }
    }

    #[test]
    fn remove_head_and_tail() {
        let q: MpscQueue<TestNode> = MpscQueue::new();
        unsafe {
            let a = node(1);
            let b = node(2);
            let c = node(3);
            q.push(a);
            q.push(b);
            q.push(c);
            q.drain_inbox();
            q.remove(a);
            q.remove(c);
            assert_eq!(take(a), 1);
            assert_eq!(take(c), 3);
            assert_eq!(take(q.pop_front()), 2);
            assert!(q.pop_front().is_null());
        }
    }

    #[test]
    fn producers_race_single_consumer() {
        const PRODUCERS: u64 = 4;
        const PER: u64 = 10_000;

        let q: Arc<MpscQueue<TestNode>> = Arc::new(MpscQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                std::thread::spawn(move || {
                    for i in 0..PER {
                        unsafe {
                            q.push(node(p * PER + i));
                        }
                    }
                })
            })
            .collect();

        let mut got = Vec::new();
        let mut last_per_producer = vec![None::<u64>; PRODUCERS as usize];
        while got.len() < (PRODUCERS * PER) as usize {
            let p = unsafe { q.pop_front() };
            if p.is_null() {
                std::thread::yield_now();
                continue;
            }
            let v = unsafe { take(p) };
            // Per-producer FIFO must hold even across interleaving.
            let producer = (v / PER) as usize;
            if let Some(prev) = last_per_producer[producer] {
                assert!(v > prev, "per-producer order violated");
            }
            last_per_producer[producer] = Some(v);
            got.push(v);
        }
        for h in handles {
            h.join().unwrap();
        }
        got.sort_unstable();
        got.dedup();
        assert_eq!(got.len(), (PRODUCERS * PER) as usize);
    }
}
