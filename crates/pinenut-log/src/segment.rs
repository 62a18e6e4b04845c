//! Segment files: naming, headers, and the write-side engine.
//!
//! ## Segment file structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (8 or 41 bytes)                                      │
//! │ - Magic bytes: "PNLG" (4)                                   │
//! │ - Version (u16 LE)                                          │
//! │ - Flags (u8, bit 0 = encrypted)                             │
//! │ - Reserved (u8, zero)                                       │
//! │ - Ephemeral public key (33 bytes, only when encrypted)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Blocks: one zstd stream, optionally AES-CBC encrypted,      │
//! │ appended to at every buffer drain                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `.pine` file may hold several such segments back to back: reopening a
//! bucket after a restart appends a fresh header (with fresh key material
//! and a fresh compression stream) rather than continuing a stream whose
//! state died with the previous process. Extraction concatenates segment
//! files, so the read path treats "one or more segments" as the normal
//! shape of any input file.
//!
//! ## Naming
//!
//! `<identifier>_<stamp>.pine`, where the stamp is the UTC bucket start at
//! the rotation's width: `YYYYMMDD`, `YYYYMMDDHH` or `YYYYMMDDHHMM`. The
//! stamp width alone identifies the bucket width, so the read path needs no
//! configuration.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::{
    compress::Compressor,
    crypt::{PublicKey, SegmentKeys, StreamEncryptor, PUBLIC_KEY_LEN},
    Domain, Error, Result, Rotation, FILE_EXTENSION, FORMAT_VERSION,
};

pub(crate) const MAGIC: [u8; 4] = *b"PNLG";
pub(crate) const FLAG_ENCRYPTED: u8 = 0b0000_0001;
pub(crate) const BASE_HEADER_LEN: usize = 8;

impl Rotation {
    fn pattern(self) -> &'static str {
        match self {
            Self::Day => "%Y%m%d",
            Self::Hour => "%Y%m%d%H",
            Self::Minute => "%Y%m%d%H%M",
        }
    }

    pub(crate) fn width_secs(self) -> i64 {
        match self {
            Self::Day => 86_400,
            Self::Hour => 3_600,
            Self::Minute => 60,
        }
    }

    /// First second of the bucket containing `datetime`.
    pub(crate) fn bucket_start(self, datetime: DateTime<Utc>) -> i64 {
        let width = self.width_secs();
        datetime.timestamp().div_euclid(width) * width
    }

    pub(crate) fn same_bucket(self, left: DateTime<Utc>, right: DateTime<Utc>) -> bool {
        self.bucket_start(left) == self.bucket_start(right)
    }

    pub(crate) fn stamp(self, datetime: DateTime<Utc>) -> String {
        datetime.format(self.pattern()).to_string()
    }
}

/// One segment file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentFile {
    pub(crate) path: PathBuf,
    /// First second of the file's bucket.
    pub(crate) start: i64,
    /// First second past the file's bucket.
    pub(crate) end: i64,
}

/// Segment files belonging to `identifier` in `dir`, sorted by bucket start.
/// A missing directory lists as empty.
pub(crate) fn list(dir: &Path, identifier: &str) -> Result<Vec<SegmentFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut segments = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((start, end)) = parse_file_name(name, identifier) {
            segments.push(SegmentFile {
                path: entry.path(),
                start,
                end,
            });
        }
    }
    segments.sort_by_key(|segment| segment.start);
    Ok(segments)
}

fn file_name(identifier: &str, stamp: &str) -> String {
    format!("{identifier}_{stamp}.{FILE_EXTENSION}")
}

/// `(bucket_start, bucket_end)` of a segment file name, if it belongs to
/// `identifier`. Identifiers may themselves contain underscores; the stamp
/// is everything after the last one.
pub(crate) fn parse_file_name(name: &str, identifier: &str) -> Option<(i64, i64)> {
    let stem = name.strip_suffix(FILE_EXTENSION)?.strip_suffix('.')?;
    let (id, stamp) = stem.rsplit_once('_')?;
    if id != identifier {
        return None;
    }
    parse_stamp(stamp)
}

fn parse_stamp(stamp: &str) -> Option<(i64, i64)> {
    if !stamp.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let (width, hour, minute) = match stamp.len() {
        8 => (86_400, 0, 0),
        10 => (3_600, stamp[8..10].parse().ok()?, 0),
        12 => (60, stamp[8..10].parse().ok()?, stamp[10..12].parse().ok()?),
        _ => return None,
    };
    let date = NaiveDate::parse_from_str(&stamp[..8], "%Y%m%d").ok()?;
    let start = date.and_hms_opt(hour, minute, 0)?.and_utc().timestamp();
    Some((start, start + width))
}

/// The parsed fixed header of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u16,
    pub(crate) eph_pub: Option<PublicKey>,
}

impl Header {
    pub(crate) fn len(&self) -> usize {
        BASE_HEADER_LEN + self.eph_pub.map_or(0, |_| PUBLIC_KEY_LEN)
    }

    /// Parses a header from the front of `bytes`.
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BASE_HEADER_LEN {
            return Err(Error::InvalidSegment("truncated header".into()));
        }
        if bytes[0..4] != MAGIC {
            return Err(Error::InvalidSegment("bad magic".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(Error::InvalidSegment(format!(
                "unsupported version {version}"
            )));
        }
        let flags = bytes[6];

        let eph_pub = if flags & FLAG_ENCRYPTED != 0 {
            let end = BASE_HEADER_LEN + PUBLIC_KEY_LEN;
            if bytes.len() < end {
                return Err(Error::InvalidSegment("truncated key".into()));
            }
            Some(
                bytes[BASE_HEADER_LEN..end]
                    .try_into()
                    .expect("slice length checked"),
            )
        } else {
            None
        };

        Ok(Self { version, eph_pub })
    }

    fn encode(flags_encrypted: bool, eph_pub: Option<&PublicKey>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BASE_HEADER_LEN + PUBLIC_KEY_LEN);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.push(if flags_encrypted { FLAG_ENCRYPTED } else { 0 });
        bytes.push(0);
        if let Some(key) = eph_pub {
            bytes.extend_from_slice(key.as_slice());
        }
        bytes
    }
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    bucket: i64,
    compressor: Compressor,
    encryptor: Option<StreamEncryptor>,
}

/// The write-side engine: holds at most one open segment, rotates on bucket
/// change, and pipes every drained buffer half through compression and
/// optional encryption.
pub(crate) struct SegmentEngine {
    domain: Domain,
    rotation: Rotation,
    compression_level: i32,
    user_key: Option<PublicKey>,
    open: Option<OpenSegment>,
}

impl SegmentEngine {
    pub(crate) fn new(
        domain: Domain,
        rotation: Rotation,
        compression_level: i32,
        user_key: Option<PublicKey>,
    ) -> Self {
        Self {
            domain,
            rotation,
            compression_level,
            user_key,
            open: None,
        }
    }

    /// Appends one drained block to the segment owning `datetime`'s bucket,
    /// finalizing the previous segment first when the bucket moved on.
    pub(crate) fn write_block(&mut self, datetime: DateTime<Utc>, frames: &[u8]) -> Result<()> {
        let bucket = self.rotation.bucket_start(datetime);

        if let Some(open) = self.open.take() {
            if open.bucket == bucket {
                self.open = Some(open);
            } else {
                Self::close(open)?;
            }
        }
        if self.open.is_none() {
            self.open = Some(self.create(datetime, bucket)?);
        }
        let Some(segment) = self.open.as_mut() else {
            return Err(Error::Panic("segment disappeared after open".into()));
        };

        let mut compressed = Vec::with_capacity(frames.len() / 2 + 64);
        segment.compressor.write(frames, &mut compressed)?;
        // Flush so the file stays decodable even if this segment is never
        // finalized (process death).
        segment.compressor.flush(&mut compressed)?;

        match segment.encryptor.as_mut() {
            Some(encryptor) => {
                let mut ciphertext = Vec::with_capacity(compressed.len() + 16);
                encryptor.write(&compressed, &mut ciphertext);
                segment.file.write_all(&ciphertext)?;
            }
            None => segment.file.write_all(&compressed)?,
        }
        Ok(())
    }

    /// Ends the open segment's streams and closes the file.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        match self.open.take() {
            Some(segment) => Self::close(segment),
            None => Ok(()),
        }
    }

    fn create(&self, datetime: DateTime<Utc>, bucket: i64) -> Result<OpenSegment> {
        fs::create_dir_all(&self.domain.directory)?;
        let stamp = self.rotation.stamp(datetime);
        let path = self
            .domain
            .directory
            .join(file_name(&self.domain.identifier, &stamp));

        let keys = match self.user_key.as_ref() {
            Some(user_pub) => Some(SegmentKeys::negotiate(user_pub)?),
            None => None,
        };

        let mut file = fs::OpenOptions::new().append(true).create(true).open(&path)?;
        let header = Header::encode(keys.is_some(), keys.as_ref().map(|keys| &keys.eph_pub));
        file.write_all(&header)?;
        debug!(path = %path.display(), "opened segment");

        Ok(OpenSegment {
            file,
            path,
            bucket,
            compressor: Compressor::begin(self.compression_level)?,
            encryptor: keys.map(|keys| StreamEncryptor::new(&keys.key)),
        })
    }

    fn close(mut segment: OpenSegment) -> Result<()> {
        let mut tail = Vec::new();
        segment.compressor.end(&mut tail)?;

        match segment.encryptor.take() {
            Some(mut encryptor) => {
                let mut ciphertext = Vec::with_capacity(tail.len() + 16);
                encryptor.write(&tail, &mut ciphertext);
                encryptor.finish(&mut ciphertext);
                segment.file.write_all(&ciphertext)?;
            }
            None => segment.file.write_all(&tail)?,
        }
        segment.file.sync_all()?;
        debug!(path = %segment.path.display(), "finalized segment");
        Ok(())
    }

    /// Deletes segment files whose bucket ended before `now - lifetime`
    /// seconds. The currently open segment is never deleted.
    pub(crate) fn trim(&mut self, lifetime: u64) -> Result<()> {
        let lifetime = i64::try_from(lifetime).unwrap_or(i64::MAX);
        let cutoff = crate::clock::now().timestamp().saturating_sub(lifetime);

        for segment in list(&self.domain.directory, &self.domain.identifier)? {
            if segment.end >= cutoff {
                continue;
            }
            if self
                .open
                .as_ref()
                .is_some_and(|open| open.path == segment.path)
            {
                continue;
            }
            if let Err(err) = fs::remove_file(&segment.path) {
                warn!(path = %segment.path.display(), %err, "failed to delete expired segment");
            }
        }
        Ok(())
    }
}
