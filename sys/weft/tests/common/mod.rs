// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the end-to-end tests.
//!
//! The runtime installs process-wide signal handlers and registers itself
//! in a process-global slot, so tests that bring one up must run one at a
//! time: take [`runtime_guard`] first.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use weft::{Config, SchedKind};

/// Serializes runtime-owning tests within the test binary.
pub fn runtime_guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

pub fn log_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("weft-{}-{}.log", tag, std::process::id()))
}

pub fn config(tag: &str, workers: Vec<SchedKind>) -> Config {
    Config {
        workers,
        log_path: log_path(tag),
    }
}

/// Polls `pred` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}
