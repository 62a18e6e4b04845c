//! Codec error types.
//!
//! Frames are decoded from untrusted bytes (log files survive crashes,
//! truncation and bit rot), so every decoding step reports failure instead of
//! panicking.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// A varint kept its continuation bit set past the width of the target
    /// integer type.
    #[error("varint does not fit the target integer")]
    VarintOverflow,

    /// The level byte is outside the known range.
    #[error("invalid level byte: {0}")]
    InvalidLevel(u8),

    /// A frame declared a payload length that its fields did not consume
    /// exactly.
    #[error("frame declared {declared} payload bytes but decoding consumed {consumed}")]
    FrameLength { declared: usize, consumed: usize },

    /// The seconds/nanoseconds pair does not form a valid datetime.
    #[error("invalid datetime in frame")]
    Datetime,
}

pub type Result<T> = std::result::Result<T, DecodeError>;
