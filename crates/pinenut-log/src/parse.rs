//! The read path: decrypt, decompress, decode, format.
//!
//! A Pinenut log file is one or more segments back to back (a single file
//! written by the engine, or the concatenation [`crate::extract`]
//! produces). Per segment the parser reads the fixed header, re-derives the
//! AES session key from the ephemeral public key when the segment is
//! encrypted, feeds ciphertext blocks through AES-CBC and the plaintext
//! through a streaming zstd session until zstd reports the end of the
//! frame — which is the only way to locate the boundary in front of the
//! next segment — and finally decodes the record frames.
//!
//! Parsing is best-effort by design: one corrupt segment must not poison a
//! whole archive. A failing segment is recorded, the parser re-synchronizes
//! at the next segment magic, and the collected failures come back as
//! [`Error::Segments`] after everything readable was processed.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};

use pinenut_core::frame;

use crate::{
    compress::Decompressor,
    crypt::{self, SecretKey, StreamDecryptor, BLOCK_LEN},
    error::SegmentError,
    segment, Error, Record, Result,
};

/// Parses a Pinenut log file, invoking `callback` for every record in
/// on-disk order.
///
/// `secret_key` is only consulted for encrypted segments. A callback error
/// aborts the whole parse; segment-level corruption is collected and
/// reported as [`Error::Segments`] once the rest of the file was processed.
pub fn parse(
    path: impl AsRef<Path>,
    secret_key: Option<SecretKey>,
    mut callback: impl FnMut(&Record) -> io::Result<()>,
) -> Result<()> {
    let data = fs::read(path.as_ref())?;
    let mut failures: Vec<SegmentError> = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        match parse_segment(&data[pos..], secret_key.as_ref(), &mut callback) {
            Ok(consumed) => pos += consumed,
            Err(SegmentFailure::Fatal(err)) => return Err(err),
            Err(SegmentFailure::Corrupt(err)) => {
                failures.push(SegmentError {
                    offset: pos as u64,
                    source: Box::new(err),
                });
                // Re-synchronize at the next segment header, if any.
                match find_magic(&data[pos + 1..]) {
                    Some(found) => pos += 1 + found,
                    None => break,
                }
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Segments(failures))
    }
}

/// Formats records into readable text.
pub trait Format {
    /// Renders one record and writes the result to `writer`.
    fn format(&mut self, record: &Record, writer: &mut impl Write) -> io::Result<()>;
}

/// One line per record:
///
/// ```text
/// 2023-11-14 22:13:20.000 ERROR [net] (client.rs:42 connect) [7] connection refused
/// ```
///
/// Absent optional fields collapse together with their brackets.
pub struct DefaultFormatter;

impl Format for DefaultFormatter {
    fn format(&mut self, record: &Record, writer: &mut impl Write) -> io::Result<()> {
        write!(
            writer,
            "{} {}",
            record.datetime.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level.name()
        )?;
        if let Some(tag) = record.tag.as_deref() {
            write!(writer, " [{tag}]")?;
        }
        if record.file.is_some() || record.line.is_some() || record.func.is_some() {
            write!(writer, " (")?;
            if let Some(file) = record.file.as_deref() {
                write!(writer, "{file}")?;
            }
            if let Some(line) = record.line {
                write!(writer, ":{line}")?;
            }
            if let Some(func) = record.func.as_deref() {
                write!(writer, " {func}")?;
            }
            write!(writer, ")")?;
        }
        if let Some(thread_id) = record.thread_id {
            write!(writer, " [{thread_id}]")?;
        }
        writeln!(writer, " {}", record.content)
    }
}

/// Parses `src_path` and writes each record's textual projection to
/// `dest_path`.
///
/// The destination is created lazily, so a file that yields no records
/// leaves no output behind. On error a partial destination may remain; the
/// caller owns its cleanup.
pub fn parse_to_file(
    src_path: impl AsRef<Path>,
    dest_path: impl AsRef<Path>,
    secret_key: Option<SecretKey>,
    mut formatter: impl Format,
) -> Result<()> {
    let mut writer = BufWriter::new(LazyFile::new(dest_path.as_ref()));
    let result = parse(src_path, secret_key, |record| {
        formatter.format(record, &mut writer)
    });
    writer.flush()?;
    result
}

// ============ Internal ============

enum SegmentFailure {
    /// IO / callback failure: abort the whole parse.
    Fatal(Error),
    /// This segment is unreadable; skip to the next one.
    Corrupt(Error),
}

/// Parses one segment from the front of `data`; returns the bytes consumed.
fn parse_segment(
    data: &[u8],
    secret_key: Option<&SecretKey>,
    callback: &mut impl FnMut(&Record) -> io::Result<()>,
) -> std::result::Result<usize, SegmentFailure> {
    let header = segment::Header::parse(data).map_err(SegmentFailure::Corrupt)?;
    let mut pos = header.len();

    let mut decryptor = match header.eph_pub.as_ref() {
        None => None,
        Some(eph_pub) => {
            let secret = secret_key.ok_or(SegmentFailure::Corrupt(Error::InvalidKey))?;
            let key = crypt::derive_session_key(secret, eph_pub)
                .map_err(SegmentFailure::Corrupt)?;
            Some(StreamDecryptor::new(&key))
        }
    };

    let mut decompressor = Decompressor::new();
    let mut plain = Vec::new();

    match decryptor.as_mut() {
        Some(decryptor) => {
            // The ciphertext extent is unknown up front: feed 16-byte blocks
            // until zstd sees the end of its frame. With a wrong secret key
            // the very first block already decompresses to garbage.
            let mut complete = false;
            while !complete && pos + BLOCK_LEN <= data.len() {
                let block: &[u8; BLOCK_LEN] = data[pos..pos + BLOCK_LEN]
                    .try_into()
                    .expect("slice length checked");
                pos += BLOCK_LEN;
                let plaintext = decryptor.block(block);
                let (_, done) = decompressor
                    .stream(&plaintext, &mut plain)
                    .map_err(|_| SegmentFailure::Corrupt(Error::Decrypt))?;
                // Whatever trails the frame end inside this block is PKCS#7
                // padding.
                complete = done;
            }
            // A stream whose length was already block-aligned carries one
            // pure padding block past the frame end; consume it so the next
            // segment starts cleanly.
            if complete && pos + BLOCK_LEN <= data.len() && data[pos..pos + 4] != segment::MAGIC {
                let block: &[u8; BLOCK_LEN] = data[pos..pos + BLOCK_LEN]
                    .try_into()
                    .expect("slice length checked");
                if decryptor.block(block) == [BLOCK_LEN as u8; BLOCK_LEN] {
                    pos += BLOCK_LEN;
                }
            }
        }
        None => {
            let (consumed, _complete) = decompressor
                .stream(&data[pos..], &mut plain)
                .map_err(SegmentFailure::Corrupt)?;
            pos += consumed;
        }
    }

    let mut rest: &[u8] = &plain;
    loop {
        match frame::decode(&mut rest) {
            Ok(Some(record)) => callback(&record)
                .map_err(|err| SegmentFailure::Fatal(err.into()))?,
            Ok(None) => {
                if rest.is_empty() {
                    break;
                }
                // A trailing partial frame: the segment was cut off
                // mid-record. Everything decoded so far stands.
                return Err(SegmentFailure::Corrupt(Error::Codec(
                    pinenut_core::DecodeError::UnexpectedEnd,
                )));
            }
            Err(err) => return Err(SegmentFailure::Corrupt(Error::Codec(err))),
        }
    }

    Ok(pos)
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(segment::MAGIC.len())
        .position(|window| window == segment::MAGIC)
}

/// A file that is only created once the first byte is written.
struct LazyFile {
    path: std::path::PathBuf,
    inner: Option<File>,
}

impl LazyFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: None,
        }
    }
}

impl Write for LazyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&self.path)?;
            self.inner = Some(file);
        }
        // A `None` here was replaced by `Some` just above.
        self.inner
            .as_mut()
            .expect("destination file was just created")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
