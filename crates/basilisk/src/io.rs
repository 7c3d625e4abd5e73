//! Output sinks for the guest's `print`.
//!
//! The engine never writes to process stdout on its own; `print` routes
//! through a host-supplied [`PrintWriter`]. [`StdPrint`] is the default,
//! [`CollectStringPrint`] captures output for tests and embedders, and
//! [`NoPrint`] discards it.

use std::{
    borrow::Cow,
    io::{self, Write as _},
};

/// Sink for `print` output.
pub trait PrintWriter {
    /// Writes one formatted `print` argument, without separators.
    fn write_chunk(&mut self, chunk: Cow<'_, str>);

    /// Writes a separator or terminator character (space, newline).
    fn write_sep(&mut self, sep: char);
}

/// Writes directly to process stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_chunk(&mut self, chunk: Cow<'_, str>) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
    }

    fn write_sep(&mut self, sep: char) {
        let mut buf = [0u8; 4];
        let mut out = io::stdout().lock();
        let _ = out.write_all(sep.encode_utf8(&mut buf).as_bytes());
        if sep == '\n' {
            let _ = out.flush();
        }
    }
}

/// Accumulates all output into a string.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    output: String,
}

impl CollectStringPrint {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything printed so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Consumes the collector, returning the captured output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.output
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_chunk(&mut self, chunk: Cow<'_, str>) {
        self.output.push_str(&chunk);
    }

    fn write_sep(&mut self, sep: char) {
        self.output.push(sep);
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_chunk(&mut self, _chunk: Cow<'_, str>) {}

    fn write_sep(&mut self, _sep: char) {}
}
