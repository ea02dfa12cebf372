// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The name resolver: string -> object-id.
//!
//! A fixed-capacity open-addressing table with linear probing and
//! tombstones. Entries do not keep objects alive; they *inherit* the
//! object's lifetime through the directory: `find_and_lock` validates the
//! handle with a real directory lock, and a slot whose object has died is
//! reusable. Keys are bounded by the runtime name limit, so they are stored
//! inline.

use abi::{ErrorCode, ObjectId};

use crate::config::NAME_LEN;
use crate::dir::Directory;
use crate::dir::ObjGuard;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

fn fnv1a(key: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[derive(Clone, Copy)]
enum NameSlot {
    Empty,
    /// Freed entry; probing continues through it, insertion may reuse it.
    Tombstone,
    Used {
        hash: u64,
        len: u8,
        bytes: [u8; NAME_LEN],
        id: ObjectId,
    },
}

impl NameSlot {
    fn matches(&self, hash: u64, key: &[u8]) -> bool {
        match self {
            NameSlot::Used {
                hash: h,
                len,
                bytes,
                ..
            } => *h == hash && &bytes[..*len as usize] == key,
            _ => false,
        }
    }
}

pub(crate) struct NameTable {
    slots: spin::Mutex<Box<[NameSlot]>>,
    capacity: usize,
}

impl NameTable {
    pub(crate) fn new(capacity: usize) -> NameTable {
        assert!(capacity.is_power_of_two());
        NameTable {
            slots: spin::Mutex::new(vec![NameSlot::Empty; capacity].into_boxed_slice()),
            capacity,
        }
    }

    /// Registers `id` under the name its object reports. The object must be
    /// live and named. `AlreadyExists` if another *live* object holds the
    /// key; entries whose objects have died are displaced.
    pub(crate) fn alloc(&self, dir: &Directory, id: ObjectId) -> Result<(), ErrorCode> {
        let Some(obj) = dir.find(id) else {
            return Err(ErrorCode::NotFound);
        };
        let Some(key) = obj.name() else {
            return Err(ErrorCode::InvalidState);
        };
        let key = key.as_bytes();
        if key.is_empty() || key.len() > NAME_LEN {
            return Err(ErrorCode::InvalidState);
        }
        let hash = fnv1a(key);

        let mut slots = self.slots.lock();
        let mut insert_at: Option<usize> = None;
        for probe in 0..self.capacity {
            let i = (hash as usize + probe) & (self.capacity - 1);
            match slots[i] {
                NameSlot::Empty => {
                    let at = insert_at.unwrap_or(i);
                    slots[at] = used(hash, key, id);
                    return Ok(());
                }
                NameSlot::Tombstone => {
                    insert_at.get_or_insert(i);
                }
                NameSlot::Used { id: other, .. } => {
                    if slots[i].matches(hash, key) {
                        if dir.find(other).is_some() {
                            return Err(ErrorCode::AlreadyExists);
                        }
                        // Stale claim by a dead object: displace it.
                        slots[i] = used(hash, key, id);
                        return Ok(());
                    }
                }
            }
        }
        if let Some(at) = insert_at {
            slots[at] = used(hash, key, id);
            return Ok(());
        }
        Err(ErrorCode::OutOfMemory)
    }

    /// Looks a key up without touching the object's lock count.
    pub(crate) fn find(&self, key: &str) -> Option<ObjectId> {
        let key = key.as_bytes();
        let hash = fnv1a(key);
        let slots = self.slots.lock();
        for probe in 0..self.capacity {
            let i = (hash as usize + probe) & (self.capacity - 1);
            match slots[i] {
                NameSlot::Empty => return None,
                NameSlot::Tombstone => continue,
                NameSlot::Used { id, .. } => {
                    if slots[i].matches(hash, key) {
                        return Some(id);
                    }
                }
            }
        }
        None
    }

    /// Looks a key up and locks the object, so the caller holds a live
    /// reference. Dead entries report `None`.
    pub(crate) fn find_and_lock<'d>(
        &self,
        dir: &'d Directory,
        key: &str,
    ) -> Option<(ObjectId, ObjGuard<'d>)> {
        let id = self.find(key)?;
        let guard = dir.find(id)?;
        Some((id, guard))
    }

    /// Removes the registration for `id`. `NotFound` if it has none.
    pub(crate) fn free(&self, id: ObjectId) -> Result<(), ErrorCode> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if matches!(slot, NameSlot::Used { id: other, .. } if *other == id) {
                *slot = NameSlot::Tombstone;
                return Ok(());
            }
        }
        Err(ErrorCode::NotFound)
    }
}

fn used(hash: u64, key: &[u8], id: ObjectId) -> NameSlot {
    let mut bytes = [0u8; NAME_LEN];
    bytes[..key.len()].copy_from_slice(key);
    NameSlot::Used {
        hash,
        len: key.len() as u8,
        bytes,
        id,
    }
}
