//! Time-ranged extraction.
//!
//! Extraction is deliberately dumb: it selects the segment files whose
//! bucket intersects the requested range and concatenates them byte for
//! byte, in bucket order. No decryption, no decompression — the output is
//! itself a valid Pinenut log file, parseable with the same secret key.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use tracing::warn;

use crate::{segment, Domain, Error, Result};

/// Extracts every segment of `domain` whose bucket window intersects
/// `[start_secs, end_secs]` (inclusive, whole seconds since the epoch) into
/// `dest_path`.
///
/// The destination is created lazily; on [`Error::NotFound`] no file
/// exists. On a write error a partial destination file may remain — the
/// caller owns its cleanup.
pub fn extract(
    domain: &Domain,
    start_secs: i64,
    end_secs: i64,
    dest_path: impl AsRef<Path>,
) -> Result<()> {
    let dest_path = dest_path.as_ref();
    let mut dest: Option<File> = None;

    for segment in segment::list(&domain.directory, &domain.identifier)? {
        // Bucket [start, end) intersects the inclusive range [t0, t1].
        if segment.start > end_secs || segment.end <= start_secs {
            continue;
        }

        let mut source = File::open(&segment.path)?;
        if !starts_with_valid_header(&mut source)? {
            warn!(path = %segment.path.display(), "skipping unreadable segment");
            continue;
        }

        if dest.is_none() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            dest = Some(File::create(dest_path)?);
        }
        if let Some(dest) = dest.as_mut() {
            io::copy(&mut source, dest)?;
        }
    }

    match dest {
        Some(file) => Ok(file.sync_all()?),
        None => Err(Error::NotFound),
    }
}

/// Checks the magic and version at the start of the file, rewinding
/// afterwards. Deliberately shallower than a full header parse: an encrypted
/// segment's key bytes are payload as far as extraction is concerned.
fn starts_with_valid_header(file: &mut File) -> Result<bool> {
    let mut prefix = [0u8; segment::BASE_HEADER_LEN];
    let mut read = 0;
    while read < prefix.len() {
        match file.read(&mut prefix[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    file.seek(SeekFrom::Start(0))?;

    let version = u16::from_le_bytes([prefix[4], prefix[5]]);
    Ok(prefix[0..4] == segment::MAGIC && version == crate::FORMAT_VERSION)
}
