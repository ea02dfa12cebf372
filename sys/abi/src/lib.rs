// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary types for the weft runtime.
//!
//! These are the types that cross the boundary between the runtime proper and
//! code hosted on it: object handles, error codes, task states, exception
//! types. They are deliberately small and dependency-light so that hosted
//! programs can speak them without dragging in the runtime.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Number of bits in an `ObjectId` used to represent the slot index, rather
/// than the generation number. Sized for the default directory capacity of
/// 4096 objects.
pub const OBJECT_ID_INDEX_BITS: u32 = 12;

/// Number of bits available for the generation counter.
pub const OBJECT_ID_GEN_BITS: u32 = 32 - OBJECT_ID_INDEX_BITS;

/// Names a particular incarnation of a runtime object.
///
/// An `ObjectId` combines two fields, a slot index into the object directory
/// and a generation number. The generation number begins counting at one and
/// wraps within `OBJECT_ID_GEN_BITS` bits, skipping zero. Critically, a
/// slot's generation changes every time the slot is reused, so attempts to
/// dereference an `ObjectId` from a previous occupant of the slot fail
/// cleanly instead of aliasing the new occupant.
///
/// The all-zeroes value is reserved as [`ObjectId::INVALID`] and never names
/// a live object (live generations are nonzero).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The reserved null handle.
    pub const INVALID: Self = Self(0);

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u32 = (1 << OBJECT_ID_INDEX_BITS) - 1;

    /// Fabricates an `ObjectId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ObjectId(
            (index as u32 & Self::INDEX_MASK) | gen.0 << OBJECT_ID_INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation(self.0 >> OBJECT_ID_INDEX_BITS)
    }

    /// Checks for the reserved null handle.
    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

/// Type used to track generation numbers.
///
/// Generations count 1, 2, ... up to the field capacity and then wrap back to
/// 1. Zero is reserved so that no live `ObjectId` is ever all-zeroes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(pub u32);

impl Generation {
    /// The never-allocated state of a fresh slot.
    pub const ZERO: Self = Self(0);

    const MASK: u32 = (1 << OBJECT_ID_GEN_BITS) - 1;

    /// Successor generation, wrapping within the field and skipping zero.
    pub fn next(self) -> Self {
        let n = (self.0 + 1) & Self::MASK;
        if n == 0 {
            Generation(1)
        } else {
            Generation(n)
        }
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers from 0 to [`Priority::MAX`]. Numerically
/// *greater* priorities are more important. This type deliberately does not
/// implement `PartialOrd`/`Ord`, to keep us from confusing ourselves about
/// whether `>` means numerically greater or more important -- use
/// [`Priority::is_more_important_than`].
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Highest (most important) priority level.
    pub const MAX: Self = Self(31);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// The runtime-wide error taxonomy.
///
/// Fallible operations return `Result<T, ErrorCode>`; success is expressed
/// through `Ok`, so there is no `Ok` variant here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Something went wrong and nothing more specific applies.
    Unknown,
    /// The operation is recognized but not provided by this build.
    NotImplemented,
    /// A bounded pool or table is exhausted.
    OutOfMemory,
    /// The OS refused us: mmap, signal, or thread-level failure.
    PlatformError,
    /// The object exists but is in a state that forbids the operation.
    InvalidState,
    /// No object answers to the given handle or key.
    NotFound,
    /// An object with the given key is already registered.
    AlreadyExists,
    /// A container was observed empty.
    Empty,
    /// The object has outstanding locks and cannot be torn down yet.
    Locked,
    /// A blocking operation gave up before its condition arrived.
    Timeout,
}

/// Execution state of a task, as observed through the directory.
///
/// Lifecycle: created in `Stopped`, started into `Ready`, picked up by a
/// worker into `Running`, parked in `Blocked` by a waiting primitive, and
/// finally `Zombie` once killed or exited, pending reclamation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskState {
    Stopped = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Zombie = 4,
}

impl TaskState {
    /// Recovers a state from its wire representation. Values outside the
    /// enum come back as `None`.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::Ready),
            2 => Some(Self::Running),
            3 => Some(Self::Blocked),
            4 => Some(Self::Zombie),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Boolean properties requested at task creation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TaskFlags: u32 {
        /// Start the task immediately instead of leaving it `Stopped`.
        const START = 1 << 0;
    }
}

/// Identifies which of an event's registered sources fired it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventSource {
    /// A message arrived on the queue the owner was waiting on.
    Msg,
    /// A semaphore the owner was waiting on was posted.
    Sem,
    /// The owner's timer deadline expired.
    Timer,
    /// The owner is being killed and must unwind its wait.
    Kill,
    /// Explicit signal from another task.
    User,
}

/// Classification of an exceptional condition delivered to the handler
/// chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExceptionType {
    /// A task ran off the end of its stack into the guard page.
    StackOverflow,
    /// A memory access outside any mapped region.
    Segfault,
    /// Execution of an illegal or privileged instruction.
    IllegalInstruction,
    /// Integer fault (division by zero and friends).
    Integer,
    /// Floating-point fault.
    Fp,
    /// Bus error.
    Bus,
    /// A task aborted itself with a panic.
    Panic,
    /// Explicitly raised by user code, with an application-defined code.
    User(u32),
    /// The runtime detected an internal inconsistency.
    Internal,
}

/// What an exception handler wants done about the condition it was shown.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Flush the log, stop the workers, exit the process.
    Exit,
    /// Destroy the current task; other tasks continue.
    KillTask,
    /// The handler dealt with it; resume execution.
    Continue,
    /// Not this handler's business; ask the next one.
    Forward,
}
