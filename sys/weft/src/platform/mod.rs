// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OS abstractions: virtual memory for task stacks, futex-based parking,
//! and per-thread signal delivery. Everything that talks to `libc` directly
//! is quarantined here.

pub mod mem;
pub mod park;
pub mod signal;
