//! Pinenut — a high-throughput, on-device structured logging engine.
//!
//! Callers hand records to a [`Logger`] on any thread; the engine encodes
//! them into compact binary frames, stages the frames in a double-buffered
//! region (optionally a memory-mapped file, so buffered data survives a
//! crash), and a background drain worker streams each vacated buffer half
//! through zstd compression and optional AES encryption into time-bucketed
//! segment files.
//!
//! ## Compression
//!
//! Segments are compressed with Zstandard. One streaming session spans a
//! whole segment, so redundancy across records is exploited; the session is
//! flushed at every drain and ended before the segment closes.
//!
//! ## Encryption
//!
//! Encryption is optional and key-negotiated: the logger is configured with
//! an ECDH public key (secp256r1) and generates a fresh ephemeral key pair
//! per segment. The derived AES-128 key encrypts the compressed stream in
//! CBC mode with PKCS#7 padding; the ephemeral public key travels in the
//! segment header so the holder of the secret key can decrypt.
//!
//! ## Buffering and crash recovery
//!
//! The staging region is split into two halves: callers append to the active
//! half while the worker drains the other. With `use_mmap` enabled the
//! region lives in a memory-mapped file; if the process dies, the OS
//! persists the dirty pages, and the next [`Logger::new`] on the same
//! [`Domain`] replays the staged frames into a segment before accepting new
//! records.
//!
//! ## Reading logs back
//!
//! [`extract`] concatenates the segments overlapping a time range into a
//! single file that is itself a valid Pinenut log file; [`parse_to_file`]
//! inverts the whole pipeline (decrypt, decompress, decode) and renders
//! records through a [`Format`] implementation.
//!
//! ```no_run
//! use pinenut_log::{Config, Domain, Level, Record};
//!
//! let domain = Domain::new("myapp", "/var/log/myapp");
//! let logger = domain.logger(Config::new()).unwrap();
//! logger.log(&Record::new(Level::Info, "hello"));
//! logger.flush();
//! logger.shutdown();
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use pinenut_core::{frame, varint, DecodeError, Level, Record, RecordBuilder};

mod buffer;
pub mod clock;
mod compress;
mod crypt;
mod error;
mod extract;
mod logger;
mod mmap;
mod parse;
mod segment;

pub use crypt::{gen_key_pair, PublicKey, SecretKey, PUBLIC_KEY_LEN, SECRET_KEY_LEN};
pub use error::{Error, Result, SegmentError};
pub use extract::extract;
pub use logger::Logger;
pub use parse::{parse, parse_to_file, DefaultFormatter, Format};

/// Format version stamped into segment and buffer headers.
pub const FORMAT_VERSION: u16 = 1;

/// Extension of segment files.
pub const FILE_EXTENSION: &str = "pine";

/// Extension of the staging buffer file (mmap mode only).
pub const BUFFER_FILE_EXTENSION: &str = "buffer";

/// Default staging buffer length: 320 KB, i.e. two halves of a bit less than
/// 160 KB each.
pub const DEFAULT_BUFFER_LEN: u64 = 320 * 1024;

/// Identifies one logical log stream and the directory holding its files.
///
/// A directory must have at most one live writer; the engine does not place
/// a lock file, the single-writer rule is part of the API contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Domain {
    /// Name embedded in every file belonging to this stream.
    pub identifier: String,
    /// Directory holding the stream's segments and buffer file.
    pub directory: PathBuf,
}

impl Domain {
    pub fn new(identifier: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            directory: directory.into(),
        }
    }

    /// Opens a [`Logger`] for this domain.
    #[inline]
    pub fn logger(self, config: Config) -> Result<Logger> {
        Logger::new(self, config)
    }

    pub(crate) fn buffer_path(&self) -> PathBuf {
        self.directory
            .join(&self.identifier)
            .with_extension(BUFFER_FILE_EXTENSION)
    }
}

/// Width of the time bucket one segment file covers.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Day,
    Hour,
    #[default]
    Minute,
}

/// Logger configuration.
///
/// ```
/// use pinenut_log::{Config, Rotation};
///
/// let config = Config::new()
///     .rotation(Rotation::Hour)
///     .compression_level(3);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Back the staging buffer with a memory-mapped file so buffered records
    /// survive a crash. Enabled by default.
    pub use_mmap: bool,
    /// Total staging buffer length in bytes; rounded up to a page multiple
    /// when `use_mmap` is set. Each half holds a bit less than half of this.
    pub buffer_len: u64,
    /// Segment rotation granularity.
    pub rotation: Rotation,
    /// Base64 ECDH public key (secp256r1, 33-byte compressed point). `None`
    /// disables encryption.
    pub key_str: Option<String>,
    /// zstd compression level; zstd's full range is accepted and clamped.
    pub compression_level: i32,
}

impl Config {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_mmap(mut self, flag: bool) -> Self {
        self.use_mmap = flag;
        self
    }

    pub fn buffer_len(mut self, len: u64) -> Self {
        self.buffer_len = len;
        self
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn key_str(mut self, key: Option<impl Into<String>>) -> Self {
        self.key_str = key.map(Into::into);
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Opens a [`Logger`] with this configuration.
    #[inline]
    pub fn logger(self, domain: Domain) -> Result<Logger> {
        Logger::new(domain, self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_mmap: true,
            buffer_len: DEFAULT_BUFFER_LEN,
            rotation: Rotation::default(),
            key_str: None,
            compression_level: compress::DEFAULT_LEVEL,
        }
    }
}
