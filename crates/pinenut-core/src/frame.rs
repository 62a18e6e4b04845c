//! The on-wire frame: the length-prefixed binary form of one record.
//!
//! ## Layout
//!
//! ```text
//! varint(payload_len) || payload
//!
//! payload:
//! ┌───────┬──────────────┬─────────┬──────────┬───────────┬──────┬──────┬──────┬─────────┐
//! │ level │ secs         │ nsecs   │ line     │ thread_id │ tag  │ file │ func │ content │
//! │ u8    │ varint (zz)  │ varint  │ varint   │ varint    │ lstr │ lstr │ lstr │ lstr    │
//! └───────┴──────────────┴─────────┴──────────┴───────────┴──────┴──────┴──────┴─────────┘
//! ```
//!
//! `lstr(x)` is `varint(byte_len) || bytes`; an absent string encodes as
//! `varint(0)`. Absent `line` / `thread_id` encode their type's MAX value.
//! Frames are self-delimiting, which the engine's crash recovery relies on:
//! a buffer half can be measured by walking frames without decoding them.
//!
//! The decoder is strict: a frame whose declared length is not consumed
//! exactly is rejected.

use bytes::{BufMut, BytesMut};
use chrono::DateTime;

use crate::{error::DecodeError, varint, Level, Record};

/// Sentinel for an absent `line`.
pub const LINE_ABSENT: u32 = u32::MAX;

/// Sentinel for an absent `thread_id`.
pub const THREAD_ID_ABSENT: u64 = u64::MAX;

/// Encodes one record as a frame, appending to `out`.
pub fn encode(record: &Record, out: &mut BytesMut) {
    let mut payload = BytesMut::with_capacity(record.estimated_size());

    payload.put_u8(record.level.as_u8());
    varint::encode_i64(&mut payload, record.datetime.timestamp());
    varint::encode_u32(&mut payload, record.datetime.timestamp_subsec_nanos());
    varint::encode_u32(&mut payload, record.line.unwrap_or(LINE_ABSENT));
    varint::encode_u64(&mut payload, record.thread_id.unwrap_or(THREAD_ID_ABSENT));
    put_str(&mut payload, record.tag.as_deref());
    put_str(&mut payload, record.file.as_deref());
    put_str(&mut payload, record.func.as_deref());
    put_str(&mut payload, Some(record.content.as_str()));

    varint::encode_u64(out, payload.len() as u64);
    out.extend_from_slice(&payload);
}

/// Decodes one frame from the front of `buf`, advancing it past the frame.
///
/// Returns `Ok(None)` when `buf` starts with an incomplete frame (more bytes
/// are needed), and an error when the bytes cannot be a frame at all.
pub fn decode(buf: &mut &[u8]) -> Result<Option<Record>, DecodeError> {
    let mut probe = *buf;
    let declared = match varint::decode_u64(&mut probe) {
        Ok(len) => len as usize,
        Err(DecodeError::UnexpectedEnd) => return Ok(None),
        Err(err) => return Err(err),
    };
    if probe.len() < declared {
        return Ok(None);
    }

    let (mut payload, rest) = probe.split_at(declared);
    let record = decode_payload(&mut payload)?;
    if !payload.is_empty() {
        return Err(DecodeError::FrameLength {
            declared,
            consumed: declared - payload.len(),
        });
    }

    *buf = rest;
    Ok(Some(record))
}

/// Total encoded length (prefix included) of the frame at the front of `buf`,
/// or `None` if no complete frame starts there. A leading zero length byte is
/// treated as a terminator, never as a frame.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let mut probe = buf;
    let declared = varint::decode_u64(&mut probe).ok()? as usize;
    if declared == 0 {
        return None;
    }
    let prefix = buf.len() - probe.len();
    (probe.len() >= declared).then_some(prefix + declared)
}

/// Seconds-since-epoch of the frame at the front of `buf`, without a full
/// decode.
pub fn peek_secs(buf: &[u8]) -> Option<i64> {
    let mut probe = buf;
    let declared = varint::decode_u64(&mut probe).ok()?;
    if declared < 2 || probe.is_empty() {
        return None;
    }
    probe = &probe[1..]; // level
    varint::decode_i64(&mut probe).ok()
}

fn put_str(buf: &mut BytesMut, value: Option<&str>) {
    let bytes = value.unwrap_or("").as_bytes();
    varint::encode_u64(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

fn decode_payload(payload: &mut &[u8]) -> Result<Record, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::UnexpectedEnd);
    }
    let level_byte = payload[0];
    *payload = &payload[1..];
    let level = Level::from_u8(level_byte).ok_or(DecodeError::InvalidLevel(level_byte))?;

    let secs = varint::decode_i64(payload)?;
    let nsecs = varint::decode_u32(payload)?;
    let line = varint::decode_u32(payload)?;
    let thread_id = varint::decode_u64(payload)?;
    let tag = get_str(payload)?;
    let file = get_str(payload)?;
    let func = get_str(payload)?;
    let content = get_str(payload)?.unwrap_or_default();

    let datetime = DateTime::from_timestamp(secs, nsecs).ok_or(DecodeError::Datetime)?;

    Ok(Record {
        level,
        datetime,
        tag,
        file,
        func,
        line: (line != LINE_ABSENT).then_some(line),
        thread_id: (thread_id != THREAD_ID_ABSENT).then_some(thread_id),
        content,
    })
}

fn get_str(payload: &mut &[u8]) -> Result<Option<String>, DecodeError> {
    let len = varint::decode_u64(payload)? as usize;
    if payload.len() < len {
        return Err(DecodeError::UnexpectedEnd);
    }
    let (bytes, rest) = payload.split_at(len);
    *payload = rest;
    if len == 0 {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }
}
