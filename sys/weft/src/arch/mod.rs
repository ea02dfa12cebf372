// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support.
//!
//! Everything the rest of the runtime needs to know about the machine lives
//! behind this module: the saved-context layout and the primitive that swaps
//! one for another. The portable parts only ever see [`Context`] and the
//! three functions re-exported here.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "linux"))] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("weft currently supports x86_64 Linux only");
    }
}
