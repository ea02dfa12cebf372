// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages and per-task message queues.
//!
//! A message is a pooled buffer with a `{queue link, owner, sender}` header.
//! Ownership moves atomically with the queue push: `send` re-stamps the
//! owner, enqueues onto the receiver's MPSC queue, and from that point the
//! sender may not touch the node; the receiver re-owns it by dequeuing.
//! Dropping a [`Msg`] handle returns the buffer to the process-wide pool.
//!
//! `recv` walks the queue applying an optional filter predicate, blocks on
//! an event registered with the queue (and, for timeouts, the timer), and
//! re-scans on every wake to absorb spurious ones. The filter runs in the
//! receiver's context and must be pure and non-blocking.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use abi::{ErrorCode, EventSource, ObjectId};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::config::MSG_PAYLOAD_SIZE;
use crate::event::{self, Event};
use crate::queue::{Intrusive, Link, MpscQueue};
use crate::startup::Runtime;
use crate::task::{self, Task};
use crate::worker;

pub(crate) struct MsgNode {
    link: Link<MsgNode>,
    /// This node's own pool handle, so a raw queue pointer can be freed.
    self_id: AtomicU32,
    owner: AtomicU32,
    sender: AtomicU32,
    len: AtomicU32,
    payload: UnsafeCell<[u8; MSG_PAYLOAD_SIZE]>,
}

// The payload cell is only touched by whoever owns the message at that
// moment; ownership is handed over through the queue.
unsafe impl Send for MsgNode {}
unsafe impl Sync for MsgNode {}

unsafe impl Intrusive for MsgNode {
    fn link(&self) -> &Link<MsgNode> {
        &self.link
    }
}

impl MsgNode {
    fn new(id: ObjectId) -> MsgNode {
        MsgNode {
            link: Link::new(),
            self_id: AtomicU32::new(id.0),
            owner: AtomicU32::new(ObjectId::INVALID.0),
            sender: AtomicU32::new(ObjectId::INVALID.0),
            len: AtomicU32::new(0),
            payload: UnsafeCell::new([0; MSG_PAYLOAD_SIZE]),
        }
    }
}

/// A task's message queue: the MPSC backbone plus the event slot `send`
/// signals through when the owner is blocked waiting.
pub(crate) struct MsgChannel {
    queue: MpscQueue<MsgNode>,
    pub(crate) waiting: spin::Mutex<Option<Arc<Event>>>,
}

impl MsgChannel {
    pub(crate) fn new() -> MsgChannel {
        MsgChannel {
            queue: MpscQueue::new(),
            waiting: spin::Mutex::new(None),
        }
    }

    /// Frees every queued message back to the pool. Queue-destruction path;
    /// only called when the owner can no longer recv.
    pub(crate) fn free_all(&self, rt: &Runtime) {
        unsafe {
            loop {
                let node = self.queue.pop_front();
                if node.is_null() {
                    break;
                }
                rt.msg_free_raw(node);
            }
        }
    }
}

/// An owned message. Dropping it returns the buffer to the pool.
pub struct Msg<'rt> {
    rt: &'rt Runtime,
    node: NonNull<MsgNode>,
}

impl<'rt> Msg<'rt> {
    fn node(&self) -> &MsgNode {
        // Safety: we own the node until send or drop.
        unsafe { self.node.as_ref() }
    }

    /// The task that sent this message, if it has been through a send.
    pub fn sender(&self) -> ObjectId {
        ObjectId(self.node().sender.load(Ordering::Relaxed))
    }

    pub fn capacity(&self) -> usize {
        MSG_PAYLOAD_SIZE
    }

    pub fn payload(&self) -> &[u8] {
        let len = self.node().len.load(Ordering::Relaxed) as usize;
        // Safety: owner-exclusive access, length maintained by write().
        unsafe { &(*self.node().payload.get())[..len.min(MSG_PAYLOAD_SIZE)] }
    }

    /// Replaces the payload. Fails with `InvalidState` if `bytes` exceeds
    /// the pool's slot size.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ErrorCode> {
        if bytes.len() > MSG_PAYLOAD_SIZE {
            return Err(ErrorCode::InvalidState);
        }
        // Safety: owner-exclusive access.
        unsafe {
            (*self.node().payload.get())[..bytes.len()].copy_from_slice(bytes);
        }
        self.node().len.store(bytes.len() as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Typed payload write via `zerocopy`.
    pub fn write_as<T: IntoBytes + Immutable>(&mut self, value: &T) -> Result<(), ErrorCode> {
        self.write(value.as_bytes())
    }

    /// Typed payload read via `zerocopy`; `None` if the payload is not
    /// exactly a `T`.
    pub fn read_as<T: FromBytes>(&self) -> Option<T> {
        T::read_from_bytes(self.payload()).ok()
    }

    fn into_raw(self) -> *mut MsgNode {
        let p = self.node.as_ptr();
        core::mem::forget(self);
        p
    }
}

impl<'rt> Drop for Msg<'rt> {
    fn drop(&mut self) {
        let id = ObjectId(self.node().self_id.load(Ordering::Relaxed));
        self.rt.msg_release(id);
    }
}

/// What the recv filter predicate sees.
pub struct MsgView<'a> {
    pub sender: ObjectId,
    pub payload: &'a [u8],
}

/// Filter predicate type for selective receive. Must be pure and must not
/// block.
pub type MsgFilter<'f> = &'f dyn Fn(MsgView<'_>) -> bool;

impl Runtime {
    /// Allocates a message from the process pool.
    pub fn msg_alloc(&self) -> Result<Msg<'_>, ErrorCode> {
        let id = self.msg_pool().alloc_with(MsgNode::new)?;
        self.msg_pool().lock_first(id);
        let node = {
            let guard = self
                .msg_pool()
                .lock(id)
                .expect("freshly published message vanished");
            NonNull::from(&*guard)
        };
        Ok(Msg { rt: self, node })
    }

    /// Sends `msg` to the task `dst`. Ownership transfers to the receiver;
    /// on error the message is released.
    pub fn send(&self, dst: ObjectId, msg: Msg<'_>) -> Result<(), ErrorCode> {
        let Some(dtask) = self.dir().find_as::<Task>(dst) else {
            return Err(ErrorCode::NotFound);
        };

        let sender = worker::current_task_id().unwrap_or(ObjectId::INVALID);
        msg.node().owner.store(dst.0, Ordering::Relaxed);
        msg.node().sender.store(sender.0, Ordering::Relaxed);

        let node = msg.into_raw();
        // Safety: ownership of `node` moves to the queue with this push.
        unsafe {
            dtask.channel.queue.push(node);
        }

        // Wake the owner if it is parked on this queue. A waiter that
        // registered after our push re-scans before blocking, so the
        // message cannot be missed in the gap.
        let waiting = dtask.channel.waiting.lock().clone();
        if let Some(ev) = waiting {
            event::fire(self, &ev, EventSource::Msg);
        }
        Ok(())
    }

    /// Receives the oldest message on the calling task's queue, blocking
    /// until one arrives.
    pub fn recv(&self) -> Result<Msg<'_>, ErrorCode> {
        self.recv_filtered(None, None)
    }

    /// As [`Runtime::recv`], giving up after `ticks` with `Timeout`.
    pub fn recv_timeout(&self, ticks: u64) -> Result<Msg<'_>, ErrorCode> {
        self.recv_filtered(Some(ticks), None)
    }

    /// Full receive: optional timeout, optional filter. The filter selects
    /// which queued message to take; non-matching messages stay queued in
    /// order.
    pub fn recv_filtered(
        &self,
        timeout: Option<u64>,
        filter: Option<MsgFilter<'_>>,
    ) -> Result<Msg<'_>, ErrorCode> {
        let Some(me) = worker::current_task() else {
            return Err(ErrorCode::InvalidState);
        };
        task::unwind_if_killed(me);
        let deadline = timeout.map(|t| self.now().saturating_add(t));

        loop {
            if let Some(node) = self.scan_queue(me, filter) {
                return Ok(self.msg_from_raw(node));
            }

            let now = self.now();
            if let Some(d) = deadline {
                if now >= d {
                    return Err(ErrorCode::Timeout);
                }
            }

            // Arm a fresh event for this wait: one reference per source
            // (queue, maybe timer) plus ours.
            let ev = Event::new(me.id());
            *me.channel.waiting.lock() = Some(ev.clone());

            // A send that missed our registration may have already pushed;
            // re-scan before committing to the block.
            if let Some(node) = self.scan_queue(me, filter) {
                *me.channel.waiting.lock() = None;
                return Ok(self.msg_from_raw(node));
            }

            let timer_handle = deadline.map(|d| {
                self.timer()
                    .queue(now, d - now, ev.clone(), EventSource::Timer)
            });

            let src = task::block_current(self, &ev);

            *me.channel.waiting.lock() = None;
            if let Some(h) = timer_handle {
                if src != EventSource::Timer {
                    self.timer().cancel(&h);
                }
            }
            if src == EventSource::Kill {
                task::unwind_if_killed(me);
            }
            // Msg, Timer, spurious: loop re-scans; the deadline check
            // resolves expiry, and a message that raced the timer wins.
        }
    }

    fn scan_queue(&self, me: &Task, filter: Option<MsgFilter<'_>>) -> Option<*mut MsgNode> {
        // Safety: we are the owning task of this queue -- the single
        // consumer.
        unsafe {
            let q = &me.channel.queue;
            q.drain_inbox();
            let mut node = q.front();
            while !node.is_null() {
                let accept = match filter {
                    None => true,
                    Some(f) => {
                        let len = (*node).len.load(Ordering::Relaxed) as usize;
                        let payload = &(*(*node).payload.get())[..len.min(MSG_PAYLOAD_SIZE)];
                        f(MsgView {
                            sender: ObjectId((*node).sender.load(Ordering::Relaxed)),
                            payload,
                        })
                    }
                };
                if accept {
                    q.remove(node);
                    return Some(node);
                }
                node = q.next(node);
            }
            None
        }
    }

    fn msg_from_raw(&self, node: *mut MsgNode) -> Msg<'_> {
        Msg {
            rt: self,
            node: NonNull::new(node).expect("null message node"),
        }
    }

    /// Frees a message buffer reached through a raw queue pointer
    /// (queue-destruction path).
    pub(crate) unsafe fn msg_free_raw(&self, node: *mut MsgNode) {
        let id = ObjectId((*node).self_id.load(Ordering::Relaxed));
        self.msg_release(id);
    }

    fn msg_release(&self, id: ObjectId) {
        // The owner holds the only lock; failure here means the header
        // protocol was violated somewhere upstream.
        if self.msg_pool().try_unlock_final(id).is_err() {
            crate::rlog!("msg {:08x}: release with extra locks", id.0);
            self.msg_pool().retire(id);
        }
    }
}
