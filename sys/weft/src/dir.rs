// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object directory: the process-wide handle table.
//!
//! Every long-lived runtime entity -- task, scheduler, worker, semaphore --
//! is registered here and addressed by `ObjectId` from then on. The
//! directory is a [`Pool`] whose payload is a boxed [`Object`] trait object;
//! the trait stands in for the per-entry ops record: `on_destroy` initiates
//! teardown, the box's `Drop` is the free hook and runs exactly once when
//! the last lock drains, `describe` renders the one-line description.

use core::any::Any;
use core::fmt;

use abi::{ErrorCode, ObjectId};

use crate::pool::{Pool, PoolGuard};

/// A directory-registered entity.
pub trait Object: Send + Sync + 'static {
    /// Short lowercase kind tag ("task", "sched", ...).
    fn kind(&self) -> &'static str;

    /// The entity's registered name, if it has one. This is the seam the
    /// name resolver reads through.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Renders a one-line description.
    fn describe(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Teardown initiation hook. Runs exactly once, from the destroy call
    /// that wins the retire race, while the payload is still mapped.
    fn on_destroy(&self) {}

    /// Downcast support for typed lookups.
    fn as_any(&self) -> &dyn Any;
}

pub struct Directory {
    pool: Pool<Box<dyn Object>>,
}

impl Directory {
    pub fn new(capacity: usize) -> Self {
        Directory {
            pool: Pool::new(capacity),
        }
    }

    /// Registers an object and publishes it. The returned handle is live:
    /// `find` will succeed until `destroy`. The directory holds the
    /// ownership reference; callers take locks only while dereferencing.
    pub fn insert(&self, object: Box<dyn Object>) -> Result<ObjectId, ErrorCode> {
        let id = self.pool.alloc(object)?;
        self.pool.lock_first(id);
        self.pool.unlock(id);
        Ok(id)
    }

    /// Dereferences a handle, bumping its lock count for the life of the
    /// guard. Returns `None` for stale, dead, or invalid handles.
    pub fn find(&self, id: ObjectId) -> Option<ObjGuard<'_>> {
        self.pool.lock(id).map(|guard| ObjGuard { guard })
    }

    /// Typed dereference: as `find`, plus a downcast to the concrete type.
    pub fn find_as<T: Object>(&self, id: ObjectId) -> Option<TypedGuard<'_, T>> {
        let guard = self.pool.lock(id)?;
        if guard.as_any().is::<T>() {
            Some(TypedGuard {
                guard,
                _marker: core::marker::PhantomData,
            })
        } else {
            None
        }
    }

    /// Initiates teardown of an object. The winning caller runs
    /// `on_destroy`; the payload is freed once outstanding locks drain.
    /// Returns whether this call won (false for stale handles or repeat
    /// destroys).
    pub fn destroy(&self, id: ObjectId) -> bool {
        // Hold a lock across retire so on_destroy can still reach the
        // payload after the slot goes DEAD.
        let Some(guard) = self.find(id) else {
            return false;
        };
        let won = self.pool.retire(id);
        if won {
            guard.on_destroy();
        }
        won
    }

    /// Visits every live handle. Advisory: entries may die between the
    /// visit and any subsequent `find`.
    pub fn for_each_live(&self, f: impl FnMut(ObjectId)) {
        self.pool.for_each_live(f);
    }

    /// Writes a one-line description of every live object. Diagnostics
    /// surface.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let mut result = Ok(());
        self.pool.for_each_live(|id| {
            if result.is_ok() {
                if let Some(obj) = self.find(id) {
                    result = write!(out, "{:08x} {}: ", id.0, obj.kind())
                        .and_then(|_| obj.describe(out))
                        .and_then(|_| writeln!(out));
                }
            }
        });
        result
    }
}

/// A locked reference to a directory object.
pub struct ObjGuard<'a> {
    guard: PoolGuard<'a, Box<dyn Object>>,
}

impl<'a> core::ops::Deref for ObjGuard<'a> {
    type Target = dyn Object;

    fn deref(&self) -> &(dyn Object + 'static) {
        &**self.guard
    }
}

/// A locked, typed reference to a directory object.
pub struct TypedGuard<'a, T: Object> {
    guard: PoolGuard<'a, Box<dyn Object>>,
    _marker: core::marker::PhantomData<&'a T>,
}

impl<'a, T: Object> core::ops::Deref for TypedGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Checked by `find_as` before construction.
        self.guard.as_any().downcast_ref::<T>().unwrap()
    }
}
