// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Support for in-kernel debugging.
//!
//! For printing, this module provides the `debug!` and `debug_verbose!`
//! macros. Output goes to the [`IoWrite`] sink a board registers with
//! [`set_debug_writer`] during initialization. Messages printed before a sink
//! exists are counted and dropped.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! debug!("Yes the code gets here with value {}", i);
//! debug_verbose!("got here"); // Includes message count, file, and line.
//! ```
//!
//! ```text
//! Yes the code gets here with value 42
//! TOCK_DEBUG(0): /tock/chips/chipidea/src/udc.rs:24: got here
//! ```

use core::cell::Cell;
use core::fmt::{self, Write};

use crate::utilities::cells::OptionalCell;

/// Synchronous byte sink for debug output, usually a polled UART.
pub trait IoWrite {
    /// Writes `buf`, returning the number of bytes consumed.
    fn write(&self, buf: &[u8]) -> usize;
}

/// Formats debug lines onto an [`IoWrite`] sink.
pub struct DebugWriter {
    sink: OptionalCell<&'static dyn IoWrite>,
    count: Cell<usize>,
    dropped: Cell<usize>,
}

struct SinkAdapter<'a>(&'a dyn IoWrite);

impl Write for SinkAdapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            let written = self.0.write(bytes);
            if written == 0 {
                return Err(fmt::Error);
            }
            bytes = &bytes[written.min(bytes.len())..];
        }
        Ok(())
    }
}

impl DebugWriter {
    pub const fn new() -> DebugWriter {
        DebugWriter {
            sink: OptionalCell::empty(),
            count: Cell::new(0),
            dropped: Cell::new(0),
        }
    }

    pub fn set_sink(&self, sink: &'static dyn IoWrite) {
        self.sink.set(sink);
    }

    /// Number of lines printed so far, including dropped ones.
    pub fn count(&self) -> usize {
        self.count.get()
    }

    /// Number of lines that had no sink to go to.
    pub fn dropped(&self) -> usize {
        self.dropped.get()
    }

    fn println(&self, location: Option<&(&'static str, u32)>, args: fmt::Arguments) {
        let count = self.count.get();
        self.count.set(count.wrapping_add(1));

        match self.sink.get() {
            Some(sink) => {
                let mut out = SinkAdapter(sink);
                if let Some((file, line)) = location {
                    let _ = write!(out, "TOCK_DEBUG({}): {}:{}: ", count, file, line);
                }
                let _ = out.write_fmt(args);
                let _ = out.write_str("\r\n");
            }
            None => self.dropped.set(self.dropped.get().wrapping_add(1)),
        }
    }
}

struct DebugWriterWrapper(DebugWriter);

// Tock kernels are single threaded; the writer is only reached from the main
// loop and interrupt bottom halves.
unsafe impl Sync for DebugWriterWrapper {}

static DEBUG_WRITER: DebugWriterWrapper = DebugWriterWrapper(DebugWriter::new());

/// Registers the sink all `debug!` output goes to.
pub fn set_debug_writer(sink: &'static dyn IoWrite) {
    DEBUG_WRITER.0.set_sink(sink);
}

pub fn debug_writer() -> &'static DebugWriter {
    &DEBUG_WRITER.0
}

pub fn debug_println(args: fmt::Arguments) {
    DEBUG_WRITER.0.println(None, args);
}

pub fn debug_verbose_println(args: fmt::Arguments, file_line: &(&'static str, u32)) {
    DEBUG_WRITER.0.println(Some(file_line), args);
}

/// In-kernel `println()` debugging.
#[macro_export]
macro_rules! debug {
    () => ({
        // Allow an empty debug!() to print the location when hit
        $crate::debug!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_println(format_args!($msg));
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_println(format_args!($fmt, $($arg)+));
    });
}

/// In-kernel `println()` debugging that includes the message count, file,
/// and line.
#[macro_export]
macro_rules! debug_verbose {
    () => ({
        $crate::debug_verbose!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_verbose_println(format_args!($msg), {
            static _FILE_LINE: (&'static str, u32) = (file!(), line!());
            &_FILE_LINE
        });
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_verbose_println(format_args!($fmt, $($arg)+), {
            static _FILE_LINE: (&'static str, u32) = (file!(), line!());
            &_FILE_LINE
        });
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::boxed::Box;
    use std::cell::RefCell;
    use std::string::String;
    use std::vec::Vec;

    struct Capture {
        bytes: RefCell<Vec<u8>>,
        chunk: usize,
    }

    impl IoWrite for Capture {
        fn write(&self, buf: &[u8]) -> usize {
            let n = buf.len().min(self.chunk);
            self.bytes.borrow_mut().extend_from_slice(&buf[..n]);
            n
        }
    }

    fn capture(chunk: usize) -> &'static Capture {
        Box::leak(Box::new(Capture {
            bytes: RefCell::new(Vec::new()),
            chunk,
        }))
    }

    #[test]
    fn lines_without_sink_are_dropped() {
        let writer = DebugWriter::new();
        writer.println(None, format_args!("lost {}", 1));
        assert_eq!(writer.count(), 1);
        assert_eq!(writer.dropped(), 1);
    }

    #[test]
    fn verbose_lines_carry_count_and_location() {
        let writer = DebugWriter::new();
        let sink = capture(3);
        writer.set_sink(sink);
        writer.println(None, format_args!("plain"));
        writer.println(Some(&("udc.rs", 12)), format_args!("ep{} stalled", 0));

        let text = String::from_utf8(sink.bytes.borrow().clone()).unwrap();
        assert_eq!(text, "plain\r\nTOCK_DEBUG(1): udc.rs:12: ep0 stalled\r\n");
        assert_eq!(writer.dropped(), 0);
    }
}
