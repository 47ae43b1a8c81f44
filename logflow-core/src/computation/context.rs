use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::computation::StreamMapping;
use crate::config::ComputationPolicy;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::watermark::Watermark;

/// Handle given to a [crate::computation::Computation] on every callback. Everything requested
/// through it (produced records, timers, checkpoints) is collected and acted upon by the task
/// once the callback returns successfully.
#[derive(Debug)]
pub struct ComputationContext {
    name: String,
    partition: u16,
    mapping: Arc<StreamMapping>,
    outputs: Arc<BTreeSet<String>>,
    policy: ComputationPolicy,
    produced: Vec<(String, Record)>,
    timers: BTreeMap<String, i64>,
    checkpoint_requested: bool,
    termination_requested: bool,
    low_watermark: Watermark,
    source_low_watermark: Option<Watermark>,
}

/// State to restore when a callback fails, so a replay starts from a clean slate.
#[derive(Debug)]
pub(crate) struct Savepoint {
    produced: usize,
    timers: BTreeMap<String, i64>,
    checkpoint_requested: bool,
    termination_requested: bool,
    source_low_watermark: Option<Watermark>,
}

impl ComputationContext {
    /// Runners build the context of their computation, this is also the way to drive a
    /// computation by hand in tests. `outputs` are physical stream names.
    pub fn new(
        name: impl Into<String>,
        partition: u16,
        mapping: Arc<StreamMapping>,
        outputs: Arc<BTreeSet<String>>,
        policy: ComputationPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            partition,
            mapping,
            outputs,
            policy,
            produced: Vec::new(),
            timers: BTreeMap::new(),
            checkpoint_requested: false,
            termination_requested: false,
            low_watermark: Watermark::LOWEST,
            source_low_watermark: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the task, which is also the partition read on every input stream.
    pub fn partition(&self) -> u16 {
        self.partition
    }

    pub fn policy(&self) -> &ComputationPolicy {
        &self.policy
    }

    /// Produces a record stamped with the current low watermark.
    pub fn produce(
        &mut self,
        stream: &str,
        key: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        self.produce_record(stream, Record::new(key, data))
    }

    /// Produces a record. One carrying [Watermark::LOWEST] is stamped with the current low
    /// watermark, any other watermark is kept as is, which lets a computation start a new time
    /// domain.
    pub fn produce_record(&mut self, stream: &str, record: Record) -> Result<()> {
        let physical = self.mapping.physical(stream);
        if !self.outputs.contains(physical) {
            return Err(Error::Computation(format!(
                "{} cannot produce to undeclared stream {stream}",
                self.name
            )));
        }
        let record = if record.watermark() == Watermark::LOWEST {
            let stamp = self.low_watermark();
            record.with_watermark(stamp)
        } else {
            record
        };
        self.produced.push((physical.to_string(), record));
        Ok(())
    }

    /// Fires [crate::computation::Computation::process_timer] with `key` once the wall clock
    /// reaches `timestamp` (ms). Setting a timer again replaces it.
    pub fn set_timer(&mut self, key: impl Into<String>, timestamp: i64) {
        self.timers.insert(key.into(), timestamp);
    }

    pub fn cancel_timer(&mut self, key: &str) {
        self.timers.remove(key);
    }

    /// Marks everything processed so far, on every input partition, as safe to commit.
    pub fn ask_for_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    /// Stops the task after the current callback. This is how a source signals it is done.
    pub fn ask_for_termination(&mut self) {
        self.termination_requested = true;
    }

    /// Watermark of the data a source is currently generating.
    pub fn set_source_low_watermark(&mut self, watermark: Watermark) {
        self.source_low_watermark = Some(watermark);
    }

    pub fn low_watermark(&self) -> Watermark {
        match self.source_low_watermark {
            Some(source) if source > self.low_watermark => source,
            _ => self.low_watermark,
        }
    }

    pub(crate) fn set_low_watermark(&mut self, watermark: Watermark) {
        self.low_watermark = watermark;
    }

    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint {
            produced: self.produced.len(),
            timers: self.timers.clone(),
            checkpoint_requested: self.checkpoint_requested,
            termination_requested: self.termination_requested,
            source_low_watermark: self.source_low_watermark,
        }
    }

    pub(crate) fn rollback(&mut self, savepoint: Savepoint) {
        self.produced.truncate(savepoint.produced);
        self.timers = savepoint.timers;
        self.checkpoint_requested = savepoint.checkpoint_requested;
        self.termination_requested = savepoint.termination_requested;
        self.source_low_watermark = savepoint.source_low_watermark;
    }

    /// Records produced since the last call, with their physical stream.
    pub fn take_produced(&mut self) -> Vec<(String, Record)> {
        std::mem::take(&mut self.produced)
    }

    pub fn take_checkpoint_request(&mut self) -> bool {
        std::mem::take(&mut self.checkpoint_requested)
    }

    pub(crate) fn is_termination_requested(&self) -> bool {
        self.termination_requested
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    pub(crate) fn next_timer(&self) -> Option<i64> {
        self.timers.values().min().copied()
    }

    /// Removes and returns the timers due at `now`, earliest first.
    pub(crate) fn take_due_timers(&mut self, now: i64) -> Vec<(String, i64)> {
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|(_, ts)| **ts <= now)
            .map(|(key, ts)| (key.clone(), *ts))
            .collect();
        due.sort_by_key(|(_, ts)| *ts);
        for (key, _) in &due {
            self.timers.remove(key);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ComputationContext {
        let mapping = StreamMapping::parse(&["o1:output"]).unwrap();
        ComputationContext::new(
            "C1",
            0,
            Arc::new(mapping),
            Arc::new(BTreeSet::from(["output".to_string()])),
            ComputationPolicy::default(),
        )
    }

    #[test]
    fn produce_maps_stream_and_stamps_watermark() {
        let mut ctx = context();
        ctx.set_low_watermark(Watermark::of_timestamp(100));
        ctx.produce("o1", "k", "v").unwrap();
        ctx.produce_record(
            "o1",
            Record::new("k2", "v").with_watermark(Watermark::of_timestamp(7)),
        )
        .unwrap();
        let produced = ctx.take_produced();
        assert_eq!(produced[0].0, "output");
        assert_eq!(produced[0].1.watermark(), Watermark::of_timestamp(100));
        assert_eq!(produced[1].1.watermark(), Watermark::of_timestamp(7));
        assert!(ctx.take_produced().is_empty());
    }

    #[test]
    fn produce_to_unknown_stream_fails() {
        let mut ctx = context();
        assert!(ctx.produce("o2", "k", "v").is_err());
        assert!(ctx.produce("output2", "k", "v").is_err());
    }

    #[test]
    fn source_watermark_wins_when_higher() {
        let mut ctx = context();
        ctx.set_source_low_watermark(Watermark::of_timestamp(50));
        assert_eq!(ctx.low_watermark(), Watermark::of_timestamp(50));
        ctx.set_low_watermark(Watermark::of_timestamp(60));
        assert_eq!(ctx.low_watermark(), Watermark::of_timestamp(60));
    }

    #[test]
    fn rollback_discards_failed_attempt() {
        let mut ctx = context();
        ctx.produce("o1", "kept", "v").unwrap();
        let savepoint = ctx.savepoint();
        ctx.produce("o1", "dropped", "v").unwrap();
        ctx.set_timer("t", 10);
        ctx.ask_for_checkpoint();
        ctx.ask_for_termination();
        ctx.rollback(savepoint);
        let produced = ctx.take_produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].1.key(), "kept");
        assert!(!ctx.has_timers());
        assert!(!ctx.take_checkpoint_request());
        assert!(!ctx.is_termination_requested());
    }

    #[test]
    fn due_timers_in_time_order() {
        let mut ctx = context();
        ctx.set_timer("late", 30);
        ctx.set_timer("early", 10);
        ctx.set_timer("future", 100);
        assert_eq!(ctx.next_timer(), Some(10));
        let due = ctx.take_due_timers(50);
        assert_eq!(
            due,
            vec![("early".to_string(), 10), ("late".to_string(), 30)]
        );
        assert_eq!(ctx.next_timer(), Some(100));
    }
}
