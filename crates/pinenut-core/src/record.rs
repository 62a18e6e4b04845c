//! The record model.
//!
//! A [`Record`] is one structured log entry: severity, timestamp, optional
//! tag / source location / thread id, and the message itself. Records are
//! owned values; the engine encodes them into compact binary frames (see
//! [`crate::frame`]) the moment they are logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a log record, most severe first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// An operation failed.
    Error = 1,
    /// Something unexpected happened, or might go wrong soon.
    Warn = 2,
    /// Messages tracking the general flow of the application.
    Info = 3,
    /// Information useful while developing and troubleshooting.
    Debug = 4,
    /// More detail than `Debug`; usually disabled in production.
    Verbose = 5,
}

impl Level {
    /// The wire representation.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Level::as_u8`].
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warn),
            3 => Some(Self::Info),
            4 => Some(Self::Debug),
            5 => Some(Self::Verbose),
            _ => None,
        }
    }

    /// Upper-case name, as formatters print it.
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }
}

/// A single log record.
///
/// Textual fields are treated as UTF-8 best-effort on the read path: a parser
/// never fails because of a malformed string, it substitutes the replacement
/// character instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub level: Level,
    pub datetime: DateTime<Utc>,
    pub tag: Option<String>,
    pub file: Option<String>,
    pub func: Option<String>,
    pub line: Option<u32>,
    pub thread_id: Option<u64>,
    pub content: String,
}

impl Record {
    /// A record with the given level and content; everything else defaulted.
    pub fn new(level: Level, content: impl Into<String>) -> Self {
        Self {
            level,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Starts building a record field by field.
    #[inline]
    pub fn builder() -> RecordBuilder {
        RecordBuilder::new()
    }

    /// Rough in-memory footprint, used for capacity hints.
    pub fn estimated_size(&self) -> usize {
        32 + self.tag.as_deref().map_or(0, str::len)
            + self.file.as_deref().map_or(0, str::len)
            + self.func.as_deref().map_or(0, str::len)
            + self.content.len()
    }
}

impl Default for Record {
    fn default() -> Self {
        Self {
            level: Level::Info,
            datetime: Utc::now(),
            tag: None,
            file: None,
            func: None,
            line: None,
            thread_id: None,
            content: String::new(),
        }
    }
}

/// Builder for [`Record`].
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: Level) -> Self {
        self.record.level = level;
        self
    }

    pub fn datetime(mut self, datetime: DateTime<Utc>) -> Self {
        self.record.datetime = datetime;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.record.tag = Some(tag.into());
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.record.file = Some(file.into());
        self
    }

    pub fn func(mut self, func: impl Into<String>) -> Self {
        self.record.func = Some(func.into());
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.record.line = Some(line);
        self
    }

    pub fn thread_id(mut self, thread_id: u64) -> Self {
        self.record.thread_id = Some(thread_id);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.record.content = content.into();
        self
    }

    #[inline]
    pub fn build(self) -> Record {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Level mapping
    // ---------------------------------------------------------------

    #[test]
    fn test_level_roundtrip() {
        for level in [
            Level::Error,
            Level::Warn,
            Level::Info,
            Level::Debug,
            Level::Verbose,
        ] {
            assert_eq!(Level::from_u8(level.as_u8()), Some(level));
        }
    }

    #[test]
    fn test_level_invalid_bytes() {
        assert_eq!(Level::from_u8(0), None);
        assert_eq!(Level::from_u8(6), None);
        assert_eq!(Level::from_u8(255), None);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Debug < Level::Verbose);
    }

    #[test]
    fn test_level_serde() {
        assert_eq!(serde_json::to_string(&Level::Warn).unwrap(), "\"warn\"");
        let level: Level = serde_json::from_str("\"verbose\"").unwrap();
        assert_eq!(level, Level::Verbose);
    }

    // ---------------------------------------------------------------
    // Builder
    // ---------------------------------------------------------------

    #[test]
    fn test_builder_defaults() {
        let record = Record::builder().build();
        assert_eq!(record.level, Level::Info);
        assert!(record.tag.is_none());
        assert!(record.file.is_none());
        assert!(record.func.is_none());
        assert!(record.line.is_none());
        assert!(record.thread_id.is_none());
        assert!(record.content.is_empty());
    }

    #[test]
    fn test_builder_all_fields() {
        let datetime = DateTime::from_timestamp(1_700_000_000, 500).unwrap();
        let record = Record::builder()
            .level(Level::Error)
            .datetime(datetime)
            .tag("net")
            .file("client.rs")
            .func("connect")
            .line(42)
            .thread_id(7)
            .content("connection refused")
            .build();

        assert_eq!(record.level, Level::Error);
        assert_eq!(record.datetime, datetime);
        assert_eq!(record.tag.as_deref(), Some("net"));
        assert_eq!(record.file.as_deref(), Some("client.rs"));
        assert_eq!(record.func.as_deref(), Some("connect"));
        assert_eq!(record.line, Some(42));
        assert_eq!(record.thread_id, Some(7));
        assert_eq!(record.content, "connection refused");
    }

    #[test]
    fn test_estimated_size_counts_strings() {
        let small = Record::new(Level::Info, "x");
        let large = Record::builder()
            .tag("tag")
            .content("x".repeat(1000))
            .build();
        assert!(large.estimated_size() > small.estimated_size());
    }
}
