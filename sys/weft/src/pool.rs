// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded object pool with generational handles.
//!
//! Every slot carries a single 64-bit header word packing `{generation,
//! state, lock count}`, updated with CAS. The slot life cycle is
//!
//! ```text
//! FREE -> RESERVED -> ALIVE -> DEAD -> FREE
//! ```
//!
//! `lookup` by handle succeeds only in ALIVE with a matching generation.
//! In DEAD, new locks fail but outstanding locks keep the payload mapped;
//! the payload is dropped exactly once, by whoever moves the lock count to
//! zero while the slot is DEAD. Slot memory itself is never returned while
//! the index is live, so a stale handle can never dereference freed memory --
//! it just misses on the generation.
//!
//! Free slots form a lock-free LIFO threaded through the slots themselves;
//! the list head carries a modification tag so that pop/push cycles cannot
//! ABA each other. (The same trick the directory applies to object handles,
//! one level down.)

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use abi::{ErrorCode, Generation, ObjectId};

// Header layout: bits 0..24 lock count, 24..26 state, 32..52 generation.
const LOCK_MASK: u64 = (1 << 24) - 1;
const STATE_SHIFT: u32 = 24;
const STATE_MASK: u64 = 0b11 << STATE_SHIFT;
const GEN_SHIFT: u32 = 32;

const FREE: u64 = 0;
const RESERVED: u64 = 1;
const ALIVE: u64 = 2;
const DEAD: u64 = 3;

const fn pack(gen: u32, state: u64, locks: u64) -> u64 {
    (gen as u64) << GEN_SHIFT | state << STATE_SHIFT | locks
}

const fn gen_of(h: u64) -> u32 {
    (h >> GEN_SHIFT) as u32
}

const fn state_of(h: u64) -> u64 {
    (h & STATE_MASK) >> STATE_SHIFT
}

const fn locks_of(h: u64) -> u64 {
    h & LOCK_MASK
}

struct Slot<T> {
    header: AtomicU64,
    /// Index+1 of the next free slot; 0 terminates. Only meaningful while
    /// this slot is on the free list.
    next_free: AtomicU32,
    payload: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity pool handing out `ObjectId`s.
pub struct Pool<T> {
    slots: Box<[Slot<T>]>,
    /// `{tag:32 | index+1:32}`; 0 in the low word means empty.
    free_head: AtomicU64,
}

// Payloads are only handed out by shared reference under a lock, and only
// dropped by the single releaser, so the usual container bounds apply.
unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send + Sync> Sync for Pool<T> {}

impl<T> Pool<T> {
    /// Creates a pool of `capacity` slots. Capacity must be a power of two
    /// that fits the `ObjectId` index field.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        assert!(capacity <= ObjectId::INDEX_MASK as usize + 1);

        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { i as u32 + 2 } else { 0 };
            slots.push(Slot {
                header: AtomicU64::new(pack(0, FREE, 0)),
                next_free: AtomicU32::new(next),
                payload: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        Pool {
            slots: slots.into_boxed_slice(),
            free_head: AtomicU64::new(if capacity == 0 { 0 } else { 1 }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn pop_free(&self) -> Option<usize> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let idx1 = head as u32;
            if idx1 == 0 {
                return None;
            }
            let idx = (idx1 - 1) as usize;
            // The slot may be popped and recycled under us; the tagged CAS
            // below detects that and retries, so a stale `next` read here is
            // harmless.
            let next = self.slots[idx].next_free.load(Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let new = tag << 32 | next as u64;
            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(idx);
            }
        }
    }

    fn push_free(&self, idx: usize) {
        loop {
            let head = self.free_head.load(Ordering::Relaxed);
            self.slots[idx]
                .next_free
                .store(head as u32, Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let new = tag << 32 | (idx as u64 + 1);
            if self
                .free_head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Reserves a slot, moves `value` in, and returns its handle. The slot
    /// is RESERVED: not yet visible to [`Pool::lock`] until the caller calls
    /// [`Pool::lock_first`]. Fails with `OutOfMemory` when no slot is free.
    pub fn alloc(&self, value: T) -> Result<ObjectId, ErrorCode> {
        self.alloc_with(|_| value)
    }

    /// As [`Pool::alloc`], but the payload constructor gets to see its own
    /// handle -- for payloads that carry their id.
    pub fn alloc_with(&self, init: impl FnOnce(ObjectId) -> T) -> Result<ObjectId, ErrorCode> {
        let idx = match self.pop_free() {
            Some(i) => i,
            None => return Err(ErrorCode::OutOfMemory),
        };
        let slot = &self.slots[idx];
        let h = slot.header.load(Ordering::Relaxed);
        debug_assert_eq!(state_of(h), FREE);
        debug_assert_eq!(locks_of(h), 0);

        let gen = Generation(gen_of(h)).next();
        let id = ObjectId::for_index_and_gen(idx, gen);
        // Safety: a popped FREE slot is exclusively ours until published.
        unsafe {
            (*slot.payload.get()).write(init(id));
        }
        slot.header.store(pack(gen.0, RESERVED, 0), Ordering::Release);
        Ok(id)
    }

    /// Publishes a RESERVED slot: transitions it to ALIVE with lock count 1.
    /// Called exactly once per allocation, by the allocator, after the
    /// payload is in place.
    pub fn lock_first(&self, id: ObjectId) {
        let slot = &self.slots[id.index()];
        let expected = pack(id.generation().0, RESERVED, 0);
        let new = pack(id.generation().0, ALIVE, 1);
        let r = slot.header.compare_exchange(
            expected,
            new,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        debug_assert!(r.is_ok(), "lock_first on non-reserved slot");
    }

    /// Dereferences a handle: if the generation matches and the slot is
    /// ALIVE, takes a lock and returns a guard. Lock-free.
    pub fn lock(&self, id: ObjectId) -> Option<PoolGuard<'_, T>> {
        if id.is_invalid() || id.index() >= self.slots.len() {
            return None;
        }
        let slot = &self.slots[id.index()];
        loop {
            let h = slot.header.load(Ordering::Acquire);
            if gen_of(h) != id.generation().0 || state_of(h) != ALIVE {
                return None;
            }
            debug_assert!(locks_of(h) < LOCK_MASK);
            if slot
                .header
                .compare_exchange_weak(h, h + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(PoolGuard {
                    pool: self,
                    index: id.index(),
                });
            }
        }
    }

    /// Initiates teardown: ALIVE -> DEAD, regardless of outstanding locks.
    /// If no locks are outstanding the payload is dropped immediately;
    /// otherwise the last unlock drops it. Returns whether this call did the
    /// transition (false on generation mismatch, or if the slot was already
    /// dying).
    pub fn retire(&self, id: ObjectId) -> bool {
        if id.is_invalid() || id.index() >= self.slots.len() {
            return false;
        }
        let slot = &self.slots[id.index()];
        loop {
            let h = slot.header.load(Ordering::Acquire);
            if gen_of(h) != id.generation().0 || state_of(h) != ALIVE {
                return false;
            }
            let locks = locks_of(h);
            let new = pack(id.generation().0, DEAD, locks);
            if slot
                .header
                .compare_exchange_weak(h, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if locks == 0 {
                    // Nobody can lock a DEAD slot, so the payload is ours.
                    unsafe {
                        self.release_slot(id.index());
                    }
                }
                return true;
            }
        }
    }

    /// Atomically tears down a slot the caller holds the *only* lock on:
    /// ALIVE with lock count exactly 1 goes straight to FREE, running the
    /// destructor. Fails with `Locked` if anyone else holds a lock, leaving
    /// the caller's lock in place.
    pub fn try_unlock_final(&self, id: ObjectId) -> Result<(), ErrorCode> {
        if id.is_invalid() || id.index() >= self.slots.len() {
            return Err(ErrorCode::NotFound);
        }
        let slot = &self.slots[id.index()];
        loop {
            let h = slot.header.load(Ordering::Acquire);
            if gen_of(h) != id.generation().0 || state_of(h) != ALIVE {
                return Err(ErrorCode::InvalidState);
            }
            if locks_of(h) != 1 {
                return Err(ErrorCode::Locked);
            }
            let new = pack(id.generation().0, DEAD, 0);
            if slot
                .header
                .compare_exchange_weak(h, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe {
                    self.release_slot(id.index());
                }
                return Ok(());
            }
        }
    }

    /// Drops the lock taken by [`Pool::lock_first`] (or any lock held
    /// without a guard). On the 1 -> 0 transition of a DEAD slot, drops the
    /// payload and returns the slot to the free list.
    pub fn unlock(&self, id: ObjectId) {
        debug_assert!(!id.is_invalid() && id.index() < self.slots.len());
        let slot = &self.slots[id.index()];
        debug_assert_eq!(gen_of(slot.header.load(Ordering::Relaxed)), id.generation().0);
        self.unlock_index(id.index());
    }

    /// Drops a lock. On the 1 -> 0 transition of a DEAD slot, drops the
    /// payload and returns the slot to the free list.
    fn unlock_index(&self, idx: usize) {
        let slot = &self.slots[idx];
        loop {
            let h = slot.header.load(Ordering::Relaxed);
            let locks = locks_of(h);
            debug_assert!(locks > 0, "unlock without a lock");
            let new = h - 1;
            let last_of_dead = locks == 1 && state_of(h) == DEAD;
            let ordering = if last_of_dead {
                // The releaser needs to see every write made under other
                // locks before it drops the payload.
                Ordering::AcqRel
            } else {
                Ordering::Release
            };
            if slot
                .header
                .compare_exchange_weak(h, new, ordering, Ordering::Relaxed)
                .is_ok()
            {
                if last_of_dead {
                    unsafe {
                        self.release_slot(idx);
                    }
                }
                return;
            }
        }
    }

    /// Drops the payload and returns the slot to the free list.
    ///
    /// Safety: caller must have exclusive logical ownership of the slot --
    /// DEAD with zero locks, reachable by no new lookups.
    unsafe fn release_slot(&self, idx: usize) {
        let slot = &self.slots[idx];
        (*slot.payload.get()).assume_init_drop();
        let h = slot.header.load(Ordering::Relaxed);
        slot.header
            .store(pack(gen_of(h), FREE, 0), Ordering::Release);
        self.push_free(idx);
    }

    /// Visits every ALIVE slot id. Used for directory sweeps; concurrent
    /// mutation is tolerated (the visit is advisory, each id must still be
    /// locked to be used).
    pub fn for_each_live(&self, mut f: impl FnMut(ObjectId)) {
        for (idx, slot) in self.slots.iter().enumerate() {
            let h = slot.header.load(Ordering::Acquire);
            if state_of(h) == ALIVE {
                f(ObjectId::for_index_and_gen(idx, Generation(gen_of(h))));
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        // Exclusive access: drop any payload still in a non-FREE slot.
        for slot in self.slots.iter() {
            let h = slot.header.load(Ordering::Relaxed);
            if state_of(h) != FREE {
                unsafe {
                    (*slot.payload.get()).assume_init_drop();
                }
            }
        }
    }
}

/// A held lock on a pool slot. Dereferences to the payload; dropping it
/// unlocks (and may run the slot destructor if the slot is DEAD and this was
/// the last lock).
pub struct PoolGuard<'a, T> {
    pool: &'a Pool<T>,
    index: usize,
}

impl<'a, T> core::ops::Deref for PoolGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding a lock keeps the payload initialized and mapped.
        unsafe { (*self.pool.slots[self.index].payload.get()).assume_init_ref() }
    }
}

impl<'a, T> Drop for PoolGuard<'a, T> {
    fn drop(&mut self) {
        self.pool.unlock_index(self.index);
    }
}
