//! A [Watermark] is a single signed 64-bit value packing an event time in milliseconds, a
//! sequence number breaking ties within the same millisecond, and a completion flag telling
//! downstream that no record with a lower watermark will ever follow.
//!
//! ```text
//!  63                          16 15             1   0
//! +------------------------------+----------------+---+
//! |  timestamp (ms since epoch)  |    sequence    | c |
//! +------------------------------+----------------+---+
//! ```
//!
//! Since the timestamp holds the most significant bits, comparing two packed values compares
//! `(timestamp, sequence, completed)` lexicographically.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub(crate) mod tracker;

const COMPLETED_BITS: u32 = 1;
const SEQUENCE_BITS: u32 = 15;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + COMPLETED_BITS;

pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
pub const MAX_TIMESTAMP: i64 = i64::MAX >> TIMESTAMP_SHIFT;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(i64);

impl Watermark {
    pub const LOWEST: Watermark = Watermark(0);

    /// Packs the components, negative timestamps are clamped to zero and out of range values
    /// saturate at their maximum.
    pub fn of(timestamp: i64, sequence: u16, completed: bool) -> Self {
        let timestamp = timestamp.clamp(0, MAX_TIMESTAMP);
        let sequence = i64::from(sequence.min(MAX_SEQUENCE));
        Watermark((timestamp << TIMESTAMP_SHIFT) | (sequence << COMPLETED_BITS) | i64::from(completed))
    }

    pub fn of_timestamp(timestamp: i64) -> Self {
        Self::of(timestamp, 0, false)
    }

    pub fn of_datetime(time: DateTime<Utc>) -> Self {
        Self::of_timestamp(time.timestamp_millis())
    }

    /// Interprets an already packed value.
    pub fn from_value(value: i64) -> Self {
        Watermark(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn timestamp(self) -> i64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    pub fn sequence(self) -> u16 {
        ((self.0 >> COMPLETED_BITS) & i64::from(MAX_SEQUENCE)) as u16
    }

    pub fn is_completed(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn completed(self) -> Self {
        Watermark(self.0 | 1)
    }

    pub fn uncompleted(self) -> Self {
        Watermark(self.0 & !1)
    }

    pub fn datetime(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp())
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl From<i64> for Watermark {
    fn from(value: i64) -> Self {
        Watermark::from_value(value)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.value()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}{}",
            self.datetime().to_rfc3339(),
            self.sequence(),
            if self.is_completed() { " completed" } else { "" }
        )
    }
}

/// Hands out strictly increasing watermarks for a source, bumping the sequence when several
/// marks land in the same millisecond or when the clock moves backwards.
#[derive(Debug, Default, Clone)]
pub struct MonotonicGenerator {
    last: Watermark,
}

impl MonotonicGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts after a previously observed watermark, e.g. the one found in a checkpoint.
    pub fn starting_after(last: Watermark) -> Self {
        Self {
            last: last.uncompleted(),
        }
    }

    pub fn mark(&mut self, timestamp: i64) -> Watermark {
        let candidate = Watermark::of_timestamp(timestamp);
        self.last = if candidate > self.last {
            candidate
        } else if self.last.sequence() < MAX_SEQUENCE {
            Watermark::of(self.last.timestamp(), self.last.sequence() + 1, false)
        } else {
            Watermark::of_timestamp(self.last.timestamp() + 1)
        };
        self.last
    }

    pub fn mark_now(&mut self) -> Watermark {
        self.mark(Utc::now().timestamp_millis())
    }

    pub fn last(&self) -> Watermark {
        self.last
    }
}
