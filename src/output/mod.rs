//! Destinations for serialized window blobs.
//!
//! Storage and transport backends live outside this crate; they plug in by
//! implementing [`BlobSink`].

pub mod line;

use std::io;
use thiserror::Error;

/// Failure to hand a blob to its destination.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write blob: {0}")]
    Io(#[from] io::Error),
    /// Destination-specific failure reported by an external sink
    #[error("sink rejected blob: {0}")]
    Rejected(String),
}

/// Receives one blob per flushed window.
///
/// `timestamp` is the UTC flush time formatted as `YYYY-MM-DDTHH:MM:SSZ`.
pub trait BlobSink {
    fn deliver(&mut self, timestamp: &str, blob: &[u8]) -> Result<(), SinkError>;
}

impl<S: BlobSink + ?Sized> BlobSink for Box<S> {
    fn deliver(&mut self, timestamp: &str, blob: &[u8]) -> Result<(), SinkError> {
        (**self).deliver(timestamp, blob)
    }
}
