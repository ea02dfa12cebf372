// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time configuration.
//!
//! The runtime takes a single shape specified at compile time; everything
//! here is a plain constant so the sizing shows up in the binary rather than
//! in a config file that can drift from it.

use abi::OBJECT_ID_INDEX_BITS;

/// Capacity of the object directory. Must be a power of two no larger than
/// the index space of an `ObjectId`.
pub const MAX_OBJECTS: usize = 4096;

/// Capacity of the per-process message pool.
pub const MSG_POOL_SIZE: usize = 4096;

/// Usable payload bytes in one pooled message.
pub const MSG_PAYLOAD_SIZE: usize = 256;

/// Number of entries in the log ring.
pub const LOG_RING_SIZE: usize = 1024;

/// Formatted text bytes per log entry, excluding the fixed prefix.
pub const LOG_TEXT_SIZE: usize = 192;

/// Virtual reservation for one task stack, including the guard page.
pub const TASK_STACK_SIZE: usize = 1 << 20;

/// Kernel-style ticks per second; one tick is the timer resolution.
pub const TICKS_PER_SEC: u64 = 1000;

/// Upper bound on worker threads (and thus schedulers).
pub const MAX_WORKERS: usize = 32;

/// Maximum task/scheduler/semaphore name length, in bytes.
pub const NAME_LEN: usize = 32;

/// Capacity of the name resolver table.
pub const NAME_TABLE_CAPACITY: usize = 256;

/// Default log sink path.
pub const LOG_PATH: &str = "weft.log";

/// Number of ticks a cooperative task may run before the scheduler asks its
/// worker to reschedule.
pub const TIMESLICE_TICKS: u64 = 10;

static_assertions::const_assert!(MAX_OBJECTS.is_power_of_two());
static_assertions::const_assert!(MAX_OBJECTS <= 1 << OBJECT_ID_INDEX_BITS);
static_assertions::const_assert!(MSG_POOL_SIZE.is_power_of_two());
static_assertions::const_assert!(LOG_RING_SIZE.is_power_of_two());
static_assertions::const_assert!(MAX_WORKERS <= 32);
