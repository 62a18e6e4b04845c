//! Streaming zstd sessions.
//!
//! One compression session covers one open segment: it begins when the
//! segment is created, is flushed at every block drain (so everything the
//! file holds is decodable even if the process never closes the segment
//! cleanly), and is ended right before the segment closes — concatenating
//! into a half-finished zstd frame would make the tail unreadable.

use zstd_safe::{
    get_error_name, max_c_level, min_c_level, zstd_sys::ZSTD_EndDirective, CCtx, CParameter,
    DCtx, ErrorCode, InBuffer, OutBuffer,
};

use crate::{Error, Result};

/// Default zstd compression level.
pub(crate) const DEFAULT_LEVEL: i32 = 10;

/// Scratch output chunk size; outputs larger than this just loop.
const SCRATCH_LEN: usize = 4096;

fn zstd_error(code: ErrorCode) -> Error {
    Error::Compression(get_error_name(code).to_string())
}

/// One compression session.
pub(crate) struct Compressor {
    ctx: CCtx<'static>,
    scratch: Vec<u8>,
}

impl Compressor {
    /// Begins a session at `level`, clamped to zstd's supported range.
    pub(crate) fn begin(level: i32) -> Result<Self> {
        let mut ctx = CCtx::create();
        let level = level.clamp(min_c_level(), max_c_level());
        ctx.set_parameter(CParameter::CompressionLevel(level))
            .map_err(zstd_error)?;
        Ok(Self {
            ctx,
            scratch: vec![0u8; SCRATCH_LEN],
        })
    }

    /// Pushes input into the stream, appending produced bytes to `dst`.
    pub(crate) fn write(&mut self, input: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        self.drive(input, ZSTD_EndDirective::ZSTD_e_continue, dst)
    }

    /// Flushes buffered input so `dst` holds a decodable prefix.
    pub(crate) fn flush(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        self.drive(&[], ZSTD_EndDirective::ZSTD_e_flush, dst)
    }

    /// Ends the stream; the session cannot be written afterwards.
    pub(crate) fn end(&mut self, dst: &mut Vec<u8>) -> Result<()> {
        self.drive(&[], ZSTD_EndDirective::ZSTD_e_end, dst)
    }

    fn drive(
        &mut self,
        input: &[u8],
        directive: ZSTD_EndDirective,
        dst: &mut Vec<u8>,
    ) -> Result<()> {
        let is_input = matches!(directive, ZSTD_EndDirective::ZSTD_e_continue);
        let mut input = InBuffer::around(input);
        loop {
            let mut output = OutBuffer::around(self.scratch.as_mut_slice());
            let remaining = self
                .ctx
                .compress_stream2(&mut output, &mut input, directive)
                .map_err(zstd_error)?;
            if output.pos() > 0 {
                dst.extend_from_slice(output.as_slice());
            }

            // For plain input we are done once it is consumed; for flush/end
            // zstd returns 0 once the directive completed.
            let finished = if is_input {
                input.pos == input.src.len()
            } else {
                remaining == 0
            };
            if finished {
                return Ok(());
            }
        }
    }
}

/// One decompression session.
pub(crate) struct Decompressor {
    ctx: DCtx<'static>,
    scratch: Vec<u8>,
}

impl Decompressor {
    pub(crate) fn new() -> Self {
        Self {
            ctx: DCtx::create(),
            scratch: vec![0u8; SCRATCH_LEN],
        }
    }

    /// Feeds `input`, appending decompressed bytes to `dst`.
    ///
    /// Returns `(consumed, frame_complete)`. `frame_complete` marks the end
    /// of the zstd frame — the read path uses it to locate the boundary
    /// between consecutive segments; `consumed` may then be less than
    /// `input.len()`, the remainder belongs to whatever follows.
    pub(crate) fn stream(&mut self, input: &[u8], dst: &mut Vec<u8>) -> Result<(usize, bool)> {
        let mut input = InBuffer::around(input);
        loop {
            let mut output = OutBuffer::around(self.scratch.as_mut_slice());
            let hint = self
                .ctx
                .decompress_stream(&mut output, &mut input)
                .map_err(zstd_error)?;
            if output.pos() > 0 {
                dst.extend_from_slice(output.as_slice());
            }
            if hint == 0 {
                return Ok((input.pos, true));
            }
            if input.pos == input.src.len() && output.pos() < self.scratch.len() {
                return Ok((input.pos, false));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress_all(inputs: &[&[u8]], level: i32, end: bool) -> Vec<u8> {
        let mut compressor = Compressor::begin(level).unwrap();
        let mut out = Vec::new();
        for input in inputs {
            compressor.write(input, &mut out).unwrap();
            compressor.flush(&mut out).unwrap();
        }
        if end {
            compressor.end(&mut out).unwrap();
        }
        out
    }

    fn decompress_all(input: &[u8]) -> (Vec<u8>, usize, bool) {
        let mut decompressor = Decompressor::new();
        let mut out = Vec::new();
        let (consumed, complete) = decompressor.stream(input, &mut out).unwrap();
        (out, consumed, complete)
    }

    #[test]
    fn test_roundtrip_single_write() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let compressed = compress_all(&[data], 3, true);
        let (plain, consumed, complete) = decompress_all(&compressed);
        assert_eq!(plain, data);
        assert_eq!(consumed, compressed.len());
        assert!(complete);
    }

    #[test]
    fn test_roundtrip_many_flushed_writes() {
        let inputs: Vec<Vec<u8>> = (0..100)
            .map(|i| format!("record number {i} with some repeated payload").into_bytes())
            .collect();
        let refs: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
        let compressed = compress_all(&refs, DEFAULT_LEVEL, true);

        let (plain, _, complete) = decompress_all(&compressed);
        assert!(complete);
        assert_eq!(plain, inputs.concat());
    }

    #[test]
    fn test_unfinished_stream_still_decodes_flushed_prefix() {
        // No `end`: everything flushed so far must still decode, and the
        // frame must not report completion.
        let data = b"flushed but never ended";
        let compressed = compress_all(&[data], 3, false);
        let (plain, consumed, complete) = decompress_all(&compressed);
        assert_eq!(plain, data);
        assert_eq!(consumed, compressed.len());
        assert!(!complete);
    }

    #[test]
    fn test_frame_end_leaves_following_bytes_unconsumed() {
        let mut bytes = compress_all(&[b"first frame".as_slice()], 3, true);
        let first_len = bytes.len();
        bytes.extend_from_slice(b"PNLGtrailing");

        let (plain, consumed, complete) = decompress_all(&bytes);
        assert_eq!(plain, b"first frame");
        assert!(complete);
        assert_eq!(consumed, first_len);
    }

    #[test]
    fn test_extreme_levels_are_clamped() {
        for level in [i32::MIN, -100, 0, 22, i32::MAX] {
            let compressed = {
                let mut compressor = Compressor::begin(level).unwrap();
                let mut out = Vec::new();
                compressor.write(b"clamp me", &mut out).unwrap();
                compressor.end(&mut out).unwrap();
                out
            };
            let (plain, _, complete) = decompress_all(&compressed);
            assert_eq!(plain, b"clamp me");
            assert!(complete);
        }
    }

    #[test]
    fn test_corrupt_stream_errors() {
        let mut decompressor = Decompressor::new();
        let mut out = Vec::new();
        assert!(decompressor
            .stream(b"definitely not a zstd stream", &mut out)
            .is_err());
    }

    #[test]
    fn test_empty_input_no_progress() {
        let mut decompressor = Decompressor::new();
        let mut out = Vec::new();
        let (consumed, complete) = decompressor.stream(&[], &mut out).unwrap();
        assert_eq!(consumed, 0);
        assert!(!complete);
        assert!(out.is_empty());
    }
}
