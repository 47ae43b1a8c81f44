//! In-process [Log] keeping encoded records in memory. Records go through a [Codec] on the way
//! in and out so that malformed payloads behave as they would on a real broker: they surface as
//! poison records instead of failing the read.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::codec::{Codec, RecordCodec};
use crate::log::{Checkpoint, Log, LogError, LogPartition, Result};
use crate::record::{LogRecord, Record, flags};

#[derive(Default)]
struct State {
    streams: HashMap<String, Vec<Vec<Bytes>>>,
    /// codecs of the streams not using the default one
    codecs: HashMap<String, Arc<dyn Codec<Record>>>,
    commits: HashMap<(String, LogPartition), Checkpoint>,
}

/// Cheap to clone, clones share the same storage.
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<RwLock<State>>,
    appended: Arc<Notify>,
    codec: Arc<dyn Codec<Record>>,
    injector: Arc<ErrorInjector>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(RecordCodec))
    }

    pub fn with_codec(codec: Arc<dyn Codec<Record>>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            appended: Arc::new(Notify::new()),
            codec,
            injector: Arc::new(ErrorInjector::default()),
        }
    }

    pub fn error_injector(&self) -> &ErrorInjector {
        &self.injector
    }

    /// Appends bytes as they are, bypassing the codec.
    pub fn append_raw(&self, stream: &str, partition: u16, data: Bytes) -> Result<i64> {
        let offset = {
            let mut state = self.state.write();
            let slots = Self::partition_mut(&mut state, stream, partition)?;
            slots.push(data);
            slots.len() as i64 - 1
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Decoded content of a partition, from offset 0.
    pub fn records(&self, partition: &LogPartition) -> Result<Vec<Record>> {
        let state = self.state.read();
        let slots = Self::partition_ref(&state, &partition.stream, partition.partition)?;
        let codec = self.codec_of(&state, &partition.stream);
        Ok(slots
            .iter()
            .enumerate()
            .map(|(offset, data)| Self::decode(codec, partition, offset as i64, data).record)
            .collect())
    }

    /// Stored bytes of a partition, as the codec wrote them.
    pub fn raw_records(&self, partition: &LogPartition) -> Result<Vec<Bytes>> {
        let state = self.state.read();
        Ok(Self::partition_ref(&state, &partition.stream, partition.partition)?.clone())
    }

    fn codec_of<'a>(&'a self, state: &'a State, stream: &str) -> &'a Arc<dyn Codec<Record>> {
        state.codecs.get(stream).unwrap_or(&self.codec)
    }

    fn partition_mut<'a>(
        state: &'a mut State,
        stream: &str,
        partition: u16,
    ) -> Result<&'a mut Vec<Bytes>> {
        state
            .streams
            .get_mut(stream)
            .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?
            .get_mut(usize::from(partition))
            .ok_or_else(|| LogError::UnknownPartition {
                stream: stream.to_string(),
                partition,
            })
    }

    fn partition_ref<'a>(state: &'a State, stream: &str, partition: u16) -> Result<&'a Vec<Bytes>> {
        state
            .streams
            .get(stream)
            .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?
            .get(usize::from(partition))
            .ok_or_else(|| LogError::UnknownPartition {
                stream: stream.to_string(),
                partition,
            })
    }

    fn decode(
        codec: &Arc<dyn Codec<Record>>,
        partition: &LogPartition,
        offset: i64,
        data: &Bytes,
    ) -> LogRecord {
        let record = match codec.decode(data) {
            Ok(record) => record,
            Err(e) => {
                warn!(%partition, offset, error = %e, "Undecodable record, flagging as poison");
                Record::new("", data.clone()).with_flag(flags::POISON)
            }
        };
        LogRecord::new(partition.clone(), offset, record)
    }

    fn try_read(&self, partition: &LogPartition, from: i64, max: usize) -> Result<Vec<LogRecord>> {
        let state = self.state.read();
        let slots = Self::partition_ref(&state, &partition.stream, partition.partition)?;
        let codec = self.codec_of(&state, &partition.stream);
        let start = usize::try_from(from.max(0)).unwrap_or(usize::MAX);
        Ok(slots
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, data)| Self::decode(codec, partition, offset as i64, data))
            .collect())
    }
}

#[async_trait]
impl Log for MemoryLog {
    async fn create_stream(&self, stream: &str, partitions: u16) -> Result<bool> {
        let mut state = self.state.write();
        match state.streams.get(stream) {
            Some(existing) if existing.len() == usize::from(partitions) => Ok(false),
            Some(existing) => Err(LogError::PartitionMismatch(
                stream.to_string(),
                existing.len() as u16,
            )),
            None => {
                state
                    .streams
                    .insert(stream.to_string(), vec![Vec::new(); usize::from(partitions)]);
                Ok(true)
            }
        }
    }

    async fn exists(&self, stream: &str) -> Result<bool> {
        Ok(self.state.read().streams.contains_key(stream))
    }

    async fn partitions(&self, stream: &str) -> Result<u16> {
        self.state
            .read()
            .streams
            .get(stream)
            .map(|partitions| partitions.len() as u16)
            .ok_or_else(|| LogError::UnknownStream(stream.to_string()))
    }

    async fn set_codec(&self, stream: &str, codec: Arc<dyn Codec<Record>>) -> Result<()> {
        let mut state = self.state.write();
        let current = self.codec_of(&state, stream).name().to_string();
        let holds_records = state
            .streams
            .get(stream)
            .is_some_and(|partitions| partitions.iter().any(|slots| !slots.is_empty()));
        if holds_records && current != codec.name() {
            return Err(LogError::CodecMismatch {
                stream: stream.to_string(),
                current,
                requested: codec.name().to_string(),
            });
        }
        state.codecs.insert(stream.to_string(), codec);
        Ok(())
    }

    async fn codec(&self, stream: &str) -> Result<String> {
        let state = self.state.read();
        Ok(self.codec_of(&state, stream).name().to_string())
    }

    async fn append(&self, stream: &str, partition: u16, record: Record) -> Result<i64> {
        self.injector.apply_append_latency().await;
        if self.injector.should_fail_append() {
            return Err(LogError::Append(format!(
                "injected append failure on {stream}-{partition:02}"
            )));
        }
        let data = {
            let state = self.state.read();
            self.codec_of(&state, stream)
                .encode(&record)
                .map_err(|e| LogError::Codec(e.to_string()))?
        };
        self.append_raw(stream, partition, data)
    }

    async fn read(
        &self,
        partition: &LogPartition,
        from: i64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>> {
        if self.injector.should_fail_read() {
            return Err(LogError::Read(format!("injected read failure on {partition}")));
        }
        let deadline = Instant::now() + timeout;
        loop {
            // register interest before looking, so an append racing with the check still wakes us
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.try_read(partition, from, max)?;
            if !records.is_empty() || Instant::now() >= deadline {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_read(partition, from, max);
            }
        }
    }

    async fn end_offset(&self, partition: &LogPartition) -> Result<i64> {
        let state = self.state.read();
        Ok(Self::partition_ref(&state, &partition.stream, partition.partition)?.len() as i64)
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.injector.apply_commit_latency().await;
        if self.injector.should_fail_commit() {
            return Err(LogError::Commit(format!(
                "injected commit failure for {} on {}",
                checkpoint.computation, checkpoint.partition
            )));
        }
        let mut state = self.state.write();
        Self::partition_ref(
            &state,
            &checkpoint.partition.stream,
            checkpoint.partition.partition,
        )?;
        state.commits.insert(
            (checkpoint.computation.clone(), checkpoint.partition.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn committed(
        &self,
        computation: &str,
        partition: &LogPartition,
    ) -> Result<Option<Checkpoint>> {
        Ok(self
            .state
            .read()
            .commits
            .get(&(computation.to_string(), partition.clone()))
            .cloned())
    }
}

/// Makes a [MemoryLog] misbehave on demand.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    /// Fail the next N appends.
    fail_next_appends: AtomicUsize,
    /// Fail the next N reads.
    fail_next_reads: AtomicUsize,
    /// Fail the next N commits.
    fail_next_commits: AtomicUsize,
    /// Artificial append latency in milliseconds.
    append_latency_ms: AtomicU64,
    /// Artificial commit latency in milliseconds.
    commit_latency_ms: AtomicU64,
}

impl ErrorInjector {
    pub fn fail_appends(&self, count: usize) {
        self.fail_next_appends.store(count, Ordering::Relaxed);
    }

    pub fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::Relaxed);
    }

    pub fn fail_commits(&self, count: usize) {
        self.fail_next_commits.store(count, Ordering::Relaxed);
    }

    /// Injected commit failures not consumed yet.
    pub fn pending_commit_failures(&self) -> usize {
        self.fail_next_commits.load(Ordering::Relaxed)
    }

    pub fn set_append_latency(&self, ms: u64) {
        self.append_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_commit_latency(&self, ms: u64) {
        self.commit_latency_ms.store(ms, Ordering::Relaxed);
    }

    fn should_fail_append(&self) -> bool {
        Self::decrement_counter(&self.fail_next_appends)
    }

    fn should_fail_read(&self) -> bool {
        Self::decrement_counter(&self.fail_next_reads)
    }

    fn should_fail_commit(&self) -> bool {
        Self::decrement_counter(&self.fail_next_commits)
    }

    /// Returns true (and consumes one failure) when the counter is positive.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    async fn apply_append_latency(&self) {
        Self::apply_latency(&self.append_latency_ms).await;
    }

    async fn apply_commit_latency(&self) {
        Self::apply_latency(&self.commit_latency_ms).await;
    }

    async fn apply_latency(latency_ms: &AtomicU64) {
        let ms = latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JSON, JsonCodec, PROTO};
    use crate::watermark::Watermark;

    fn p0(stream: &str) -> LogPartition {
        LogPartition::new(stream, 0)
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let log = MemoryLog::new();
        assert!(log.create_stream("s", 2).await.unwrap());
        assert!(!log.create_stream("s", 2).await.unwrap());
        assert_eq!(
            log.create_stream("s", 3).await,
            Err(LogError::PartitionMismatch("s".into(), 2))
        );
        assert_eq!(log.partitions("s").await.unwrap(), 2);
        assert!(log.exists("s").await.unwrap());
        assert!(!log.exists("t").await.unwrap());
    }

    #[tokio::test]
    async fn appends_and_reads_in_order() {
        let log = MemoryLog::new();
        log.create_stream("s", 1).await.unwrap();
        for i in 0..5 {
            let offset = log
                .append("s", 0, Record::new(format!("k{i}"), "v"))
                .await
                .unwrap();
            assert_eq!(offset, i);
        }
        let records = log
            .read(&p0("s"), 2, 10, Duration::from_millis(1))
            .await
            .unwrap();
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);
        assert_eq!(records[0].record.key(), "k2");
        assert_eq!(log.end_offset(&p0("s")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_partition_is_an_error() {
        let log = MemoryLog::new();
        log.create_stream("s", 1).await.unwrap();
        assert!(matches!(
            log.append("s", 1, Record::new("k", "v")).await,
            Err(LogError::UnknownPartition { partition: 1, .. })
        ));
        assert!(matches!(
            log.append("nope", 0, Record::new("k", "v")).await,
            Err(LogError::UnknownStream(_))
        ));
    }

    #[tokio::test]
    async fn read_waits_for_append() {
        let log = MemoryLog::new();
        log.create_stream("s", 1).await.unwrap();
        let writer = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", 0, Record::new("late", "v")).await
        });
        let records = log
            .read(&p0("s"), 0, 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(handle.await.unwrap(), Ok(0));
    }

    #[tokio::test]
    async fn read_times_out_empty() {
        let log = MemoryLog::new();
        log.create_stream("s", 1).await.unwrap();
        let records = log
            .read(&p0("s"), 0, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn malformed_bytes_read_as_poison() {
        let log = MemoryLog::new();
        log.create_stream("s", 1).await.unwrap();
        log.append_raw("s", 0, Bytes::from_static(&[0xff, 0xff, 0xff]))
            .unwrap();
        let records = log
            .read(&p0("s"), 0, 1, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(records[0].record.is_poison());
        assert_eq!(records[0].record.data().as_ref(), &[0xff, 0xff, 0xff]);
    }

    #[tokio::test]
    async fn commit_and_lag() {
        let log = MemoryLog::new();
        log.create_stream("s", 2).await.unwrap();
        for partition in 0..2 {
            for _ in 0..3 {
                log.append("s", partition, Record::new("k", "v")).await.unwrap();
            }
        }
        assert_eq!(log.committed("c", &p0("s")).await.unwrap(), None);
        assert_eq!(log.lag("c", "s").await.unwrap().lag(), 6);

        let checkpoint = Checkpoint {
            computation: "c".into(),
            partition: p0("s"),
            offset: 2,
            watermark: Watermark::of_timestamp(1),
        };
        log.commit(&checkpoint).await.unwrap();
        assert_eq!(log.committed("c", &p0("s")).await.unwrap(), Some(checkpoint));
        let lag = log.lag("c", "s").await.unwrap();
        assert_eq!(lag.lag(), 4);
        assert_eq!(lag.upper, 6);
        // other consumers are unaffected
        assert_eq!(log.lag("other", "s").await.unwrap().lag(), 6);
    }

    #[tokio::test]
    async fn streams_keep_their_own_codec() {
        let log = MemoryLog::new();
        log.create_stream("j", 1).await.unwrap();
        log.create_stream("p", 1).await.unwrap();
        log.set_codec("j", Arc::new(JsonCodec::<Record>::new()))
            .await
            .unwrap();
        assert_eq!(log.codec("j").await.unwrap(), JSON);
        assert_eq!(log.codec("p").await.unwrap(), PROTO);

        let record = Record::new("k", "v").with_watermark(Watermark::of_timestamp(3));
        log.append("j", 0, record.clone()).await.unwrap();
        log.append("p", 0, record.clone()).await.unwrap();
        let json = &log.raw_records(&p0("j")).unwrap()[0];
        assert!(serde_json::from_slice::<serde_json::Value>(json).is_ok());
        assert_eq!(log.records(&p0("j")).unwrap(), [record.clone()]);
        assert_eq!(log.records(&p0("p")).unwrap(), [record]);

        // same codec again is fine, switching a stream holding records is not
        log.set_codec("j", Arc::new(JsonCodec::<Record>::new()))
            .await
            .unwrap();
        assert!(matches!(
            log.set_codec("p", Arc::new(JsonCodec::<Record>::new())).await,
            Err(LogError::CodecMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let log = MemoryLog::new();
        log.create_stream("s", 1).await.unwrap();
        log.error_injector().fail_appends(2);
        assert!(log.append("s", 0, Record::new("k", "v")).await.is_err());
        assert!(log.append("s", 0, Record::new("k", "v")).await.is_err());
        assert_eq!(log.append("s", 0, Record::new("k", "v")).await, Ok(0));
    }
}
