//! Line-oriented blob sink.
//!
//! Each flush becomes one line: `<timestamp> <sensor count> <blob as hex>`.

use crate::output::{BlobSink, SinkError};
use std::fmt;
use std::io::Write;

/// Lowercase hex rendering of a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Writes blobs as text lines to any writer, flushing after each line.
#[derive(Debug)]
pub struct LineSink<W: Write> {
    out: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> BlobSink for LineSink<W> {
    fn deliver(&mut self, timestamp: &str, blob: &[u8]) -> Result<(), SinkError> {
        let count = blob.first().copied().unwrap_or(0);
        writeln!(self.out, "{timestamp} {count} {}", Hex(blob))?;
        self.out.flush()?;
        Ok(())
    }
}
