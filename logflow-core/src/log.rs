//! Computations are connected through a partitioned, append-only [Log]. Every stream is split
//! into a fixed number of partitions, each one an ordered sequence of [Record]s addressed by a
//! monotonically increasing offset.

use std::fmt;
use std::hash::{DefaultHasher, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::record::{LogRecord, Record};
use crate::watermark::Watermark;

pub(crate) mod error;
pub mod memory;

pub use error::LogError;

pub type Result<T> = std::result::Result<T, LogError>;

/// Picks the partition a keyed record is appended to. Records sharing a key always land in the
/// same partition, which is what keeps them ordered.
pub fn determine_partition(key: &str, partitions: u16) -> u16 {
    if partitions <= 1 {
        return 0;
    }
    let mut hash = DefaultHasher::new();
    hash.write(key.as_bytes());
    (hash.finish() % u64::from(partitions)) as u16
}

/// A single partition of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPartition {
    pub stream: String,
    pub partition: u16,
}

impl LogPartition {
    pub fn new(stream: impl Into<String>, partition: u16) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }
}

impl fmt::Display for LogPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.stream, self.partition)
    }
}

/// Durable progress of a computation on one input partition. `offset` is the next offset to
/// read, everything below it has been fully processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub computation: String,
    pub partition: LogPartition,
    pub offset: i64,
    pub watermark: Watermark,
}

/// Distance between the committed position of a consumer and the end of the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLag {
    /// committed offset (summed over partitions)
    pub lower: i64,
    /// end offset (summed over partitions)
    pub upper: i64,
}

impl LogLag {
    pub fn of(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    pub fn lag(&self) -> i64 {
        (self.upper - self.lower).max(0)
    }

    pub fn merge(self, other: LogLag) -> Self {
        Self {
            lower: self.lower + other.lower,
            upper: self.upper + other.upper,
        }
    }
}

impl fmt::Display for LogLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogLag(lag: {}, lower: {}, upper: {})", self.lag(), self.lower, self.upper)
    }
}

/// Storage contract the engine runs on. Implementations are shared between every task of a
/// processor, so all methods take `&self`.
#[async_trait]
pub trait Log: Send + Sync {
    /// Creates the stream unless it already exists. Returns true when it was created, fails if
    /// it exists with a different partition count.
    async fn create_stream(&self, stream: &str, partitions: u16) -> Result<bool>;

    async fn exists(&self, stream: &str) -> Result<bool>;

    async fn partitions(&self, stream: &str) -> Result<u16>;

    /// Stores the records of `stream` with `codec` from now on. Refused once the stream holds
    /// records written with a different codec.
    async fn set_codec(&self, stream: &str, codec: Arc<dyn Codec<Record>>) -> Result<()>;

    /// Name of the codec the records of `stream` are stored with.
    async fn codec(&self, stream: &str) -> Result<String>;

    /// Appends the record at the end of the partition and returns its offset.
    async fn append(&self, stream: &str, partition: u16, record: Record) -> Result<i64>;

    /// Reads up to `max` records starting at offset `from`, waiting up to `timeout` when none
    /// is available yet. Records come back in offset order.
    async fn read(
        &self,
        partition: &LogPartition,
        from: i64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>>;

    /// Offset the next appended record will get.
    async fn end_offset(&self, partition: &LogPartition) -> Result<i64>;

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn committed(
        &self,
        computation: &str,
        partition: &LogPartition,
    ) -> Result<Option<Checkpoint>>;

    /// Lag of `computation` on every partition of `stream`, summed.
    async fn lag(&self, computation: &str, stream: &str) -> Result<LogLag> {
        let mut lag = LogLag::default();
        for partition in 0..self.partitions(stream).await? {
            let partition = LogPartition::new(stream, partition);
            let upper = self.end_offset(&partition).await?;
            let lower = self
                .committed(computation, &partition)
                .await?
                .map_or(0, |checkpoint| checkpoint.offset);
            lag = lag.merge(LogLag::of(lower, upper));
        }
        Ok(lag)
    }
}
