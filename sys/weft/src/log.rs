// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The runtime log.
//!
//! Writers format into a fixed-size line on their own stack and push it
//! onto the MPMC ring -- no heap, no blocking, safe from signal handlers.
//! A flush thread drains the ring to the file sink. When the ring is full
//! the entry is dropped and an overflow counter ticks up; the count rides
//! along on the next successful entry and shows up as an `OVF:` prefix.
//!
//! Line format (one line per entry):
//!
//! ```text
//! OVF: <n> [<tick>] w<worker> <text>
//! ```
//!
//! with the overflow prefix and worker id optional.

use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicU32, Ordering};
use std::io::Write as _;

use abi::ErrorCode;

use crate::config::{LOG_RING_SIZE, LOG_TEXT_SIZE};
use crate::ring::Ring;

const NO_WORKER: u8 = u8::MAX;

pub(crate) struct LogLine {
    tick: u64,
    ovf: u32,
    worker: u8,
    len: u16,
    text: [u8; LOG_TEXT_SIZE],
}

pub(crate) struct Log {
    ring: Ring<LogLine>,
    overflow: AtomicU32,
    sink: spin::Mutex<Option<std::fs::File>>,
}

impl Log {
    pub(crate) fn new(path: &std::path::Path) -> Result<Log, ErrorCode> {
        let file = std::fs::File::create(path).map_err(|_| ErrorCode::PlatformError)?;
        Ok(Log {
            ring: Ring::new(LOG_RING_SIZE),
            overflow: AtomicU32::new(0),
            sink: spin::Mutex::new(Some(file)),
        })
    }

    /// Formats and enqueues one entry. Never blocks; drops (and counts) the
    /// entry when the ring is full.
    pub(crate) fn write(&self, tick: u64, worker: Option<usize>, args: fmt::Arguments<'_>) {
        let mut text = [0u8; LOG_TEXT_SIZE];
        let mut w = FixedWriter {
            buf: &mut text,
            len: 0,
        };
        // Truncation is fine; FixedWriter never errors.
        let _ = w.write_fmt(args);
        let len = w.len as u16;

        let ovf = self.overflow.swap(0, Ordering::Relaxed);
        let line = LogLine {
            tick,
            ovf,
            worker: worker.map(|w| w as u8).unwrap_or(NO_WORKER),
            len,
            text,
        };
        if self.ring.push(line).is_err() {
            // Ring full: put the taken count back, plus us.
            self.overflow
                .fetch_add(ovf.saturating_add(1), Ordering::Relaxed);
        }
    }

    /// Drains everything currently in the ring to the sink. Returns how
    /// many lines went out.
    pub(crate) fn flush(&self) -> usize {
        let mut out = Vec::with_capacity(LOG_TEXT_SIZE + 32);
        let mut n = 0;
        while let Some(entry) = self.ring.pop() {
            out.clear();
            if entry.ovf > 0 {
                let _ = write!(out, "OVF: {} ", entry.ovf);
            }
            let _ = write!(out, "[{:06}] ", entry.tick);
            if entry.worker != NO_WORKER {
                let _ = write!(out, "w{} ", entry.worker);
            }
            out.extend_from_slice(&entry.text[..entry.len as usize]);
            out.push(b'\n');

            let mut sink = self.sink.lock();
            if let Some(f) = sink.as_mut() {
                let _ = f.write_all(&out);
            }
            n += 1;
        }
        n
    }

    /// Final drain: everything out, file flushed, sink released. Part of
    /// the shutdown quiesce phase -- workers are already stopped, timers
    /// cancelled, so nothing new arrives mid-drain.
    pub(crate) fn quiesce(&self) {
        self.flush();
        let mut sink = self.sink.lock();
        if let Some(mut f) = sink.take() {
            let _ = f.flush();
        }
    }

    #[cfg(test)]
    fn overflow_count(&self) -> u32 {
        self.overflow.load(Ordering::Relaxed)
    }
}

struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let avail = self.buf.len() - self.len;
        let n = s.len().min(avail);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Writes a formatted entry to the active runtime's log; silently a no-op
/// when no runtime is up. This is what the `rlog!` macro expands to.
pub fn write_active(args: fmt::Arguments<'_>) {
    if let Some(rt) = crate::startup::active() {
        rt.log()
            .write(rt.now(), crate::worker::current_index(), args);
    }
}

/// Logs a line through the active runtime. Usable anywhere in the process,
/// including signal handlers (the write path neither allocates nor
/// blocks).
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::write_active(core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("weft-log-test-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn line_format() {
        let path = temp_log("fmt");
        let log = Log::new(&path).unwrap();
        log.write(42, Some(3), format_args!("hello {}", "there"));
        log.write(43, None, format_args!("no worker"));
        assert_eq!(log.flush(), 2);
        log.quiesce();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("[000042] w3 hello there"));
        assert_eq!(lines.next(), Some("[000043] no worker"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn overflow_is_counted_and_reported() {
        let path = temp_log("ovf");
        let log = Log::new(&path).unwrap();
        // Fill the ring and then some.
        for i in 0..LOG_RING_SIZE + 5 {
            log.write(i as u64, None, format_args!("entry {i}"));
        }
        assert_eq!(log.overflow_count(), 5);
        log.flush();
        // Next entry carries the overflow annotation.
        log.write(9999, None, format_args!("after the storm"));
        log.flush();
        log.quiesce();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("OVF: 5 [009999] after the storm"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn long_lines_truncate() {
        let path = temp_log("trunc");
        let log = Log::new(&path).unwrap();
        let big = "x".repeat(LOG_TEXT_SIZE * 2);
        log.write(1, None, format_args!("{big}"));
        log.flush();
        log.quiesce();
        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().unwrap();
        assert_eq!(line.len(), "[000001] ".len() + LOG_TEXT_SIZE);
        std::fs::remove_file(&path).ok();
    }
}
