//! Engine error types.
//!
//! One error type covers the whole engine, with a coarse split between
//! expected failures (IO, malformed files, bad keys, bad configuration) and
//! internal invariant violations ([`Error::is_panic`]).
//!
//! Write-path policy: the drain worker logs and drops its errors — `log()`
//! never surfaces an IO error to the caller, the data is already staged and
//! the worker retries on the next drain. Read-path operations return their
//! errors.

use std::io;

use thiserror::Error;

use pinenut_core::DecodeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Malformed record frame.
    #[error("codec: {0}")]
    Codec(#[from] DecodeError),

    /// zstd reported an error, or a compressed stream is corrupt.
    #[error("compression: {0}")]
    Compression(String),

    /// A public or secret key is malformed: bad base64, wrong length, or not
    /// a point on the curve.
    #[error("invalid key")]
    InvalidKey,

    /// Decryption produced an unreadable stream. With a key-negotiated
    /// scheme this is indistinguishable from using the wrong secret key.
    #[error("decryption failed")]
    Decrypt,

    /// A segment header could not be understood.
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// Rejected configuration value.
    #[error("config: {0}")]
    Config(String),

    /// No segment overlaps the requested time range.
    #[error("no segments in the requested time range")]
    NotFound,

    /// Operation attempted after the logger shut down.
    #[error("logger is shut down")]
    State,

    /// An internal invariant was violated; unrecoverable.
    #[error("internal invariant violated: {0}")]
    Panic(String),

    /// One or more segments failed while parsing a file; the remaining
    /// segments were still processed.
    #[error("{} segment(s) failed to parse", .0.len())]
    Segments(Vec<SegmentError>),
}

impl Error {
    /// `true` for unrecoverable internal bugs, `false` for expected
    /// failures.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panic(_))
    }
}

/// A parse failure scoped to one segment of a log file.
#[derive(Debug, Error)]
#[error("segment at byte {offset}: {source}")]
pub struct SegmentError {
    /// Byte offset of the segment header within the parsed file.
    pub offset: u64,
    #[source]
    pub source: Box<Error>,
}

pub type Result<T> = std::result::Result<T, Error>;
