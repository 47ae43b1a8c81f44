use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::LogPartition;
use crate::watermark::Watermark;

/// Flags travelling with a [Record].
pub mod flags {
    pub const DEFAULT: &str = "default";
    /// The producer asked for a checkpoint after this record.
    pub const COMMIT: &str = "commit";
    /// The bytes could not be decoded; the record can only be dead-lettered.
    pub const POISON: &str = "poison";
    /// Control record carrying a producer task's completed watermark, never handed to
    /// computations.
    pub const WATERMARK: &str = "watermark";
    /// Set on records moved to a dead-letter stream.
    pub const DEAD_LETTER: &str = "dead-letter";
}

/// Unit of data in a stream. Once produced a record is never mutated, the `with_*` builders
/// consume it and return a new value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    key: String,
    data: Bytes,
    watermark: Watermark,
    flags: BTreeSet<String>,
}

impl Record {
    pub fn new(key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
            watermark: Watermark::LOWEST,
            flags: BTreeSet::new(),
        }
    }

    /// Control record telling consumers that `producer` will not emit anything below
    /// `watermark` on this partition anymore.
    pub fn completion_marker(producer: impl Into<String>, watermark: Watermark) -> Self {
        Self::new(producer, Bytes::new())
            .with_watermark(watermark.completed())
            .with_flag(flags::WATERMARK)
    }

    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_control(&self) -> bool {
        self.has_flag(flags::WATERMARK)
    }

    pub fn is_poison(&self) -> bool {
        self.has_flag(flags::POISON)
    }

    pub(crate) fn into_parts(self) -> (String, Bytes, Watermark, BTreeSet<String>) {
        (self.key, self.data, self.watermark, self.flags)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record(key: {}, size: {}, watermark: {}, flags: {:?})",
            self.key,
            self.data.len(),
            self.watermark,
            self.flags
        )
    }
}

/// A [Record] as read back from a log partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: LogPartition,
    pub offset: i64,
    pub record: Record,
}

impl LogRecord {
    pub fn new(partition: LogPartition, offset: i64, record: Record) -> Self {
        Self {
            partition,
            offset,
            record,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.partition, self.offset, self.record)
    }
}
