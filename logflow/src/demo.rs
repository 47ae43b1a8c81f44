//! Demo topology: numbered records flowing from a generator to a per key counter.
//!
//! ```text
//!   generator ──► generated ──► square ──► squared ──► counter
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use logflow_core::{
    BatchComputation, Batched, Computation, ComputationContext, ComputationMetadata, Error,
    LogRecord, MonotonicGenerator, Record, Result, Topology,
};
use logflow_sequencer::Sequencer;
use parking_lot::Mutex;
use tracing::debug;

pub const GENERATED: &str = "generated";
pub const SQUARED: &str = "squared";

const SEQUENCE: &str = "demo-records";
const KEYS: i64 = 16;
const BLOCK_SIZE: usize = 50;
const TICK_MILLIS: i64 = 5;

/// Emits `count` records numbered by the sequencer, a block per timer tick, then terminates.
struct Generator {
    sequencer: Arc<dyn Sequencer>,
    remaining: usize,
    watermarks: MonotonicGenerator,
}

#[async_trait]
impl Computation for Generator {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_arity("generator", 0, 1)
    }

    async fn init(&mut self, ctx: &mut ComputationContext) -> Result<()> {
        ctx.set_timer("tick", 0);
        Ok(())
    }

    async fn process_record(
        &mut self,
        _ctx: &mut ComputationContext,
        _input_stream: &str,
        _record: &LogRecord,
    ) -> Result<()> {
        Ok(())
    }

    async fn process_timer(
        &mut self,
        ctx: &mut ComputationContext,
        _key: &str,
        _timestamp: i64,
    ) -> Result<()> {
        let size = self.remaining.min(BLOCK_SIZE);
        if size > 0 {
            let ids = self
                .sequencer
                .get_next_block(SEQUENCE, size)
                .await
                .map_err(|e| Error::Computation(e.to_string()))?;
            for id in ids {
                let watermark = self.watermarks.mark_now();
                let record = Record::new(format!("key-{:02}", id % KEYS), id.to_string())
                    .with_watermark(watermark);
                ctx.produce_record("o1", record)?;
                ctx.set_source_low_watermark(watermark);
            }
            self.remaining -= size;
        }
        if self.remaining == 0 {
            ctx.ask_for_termination();
        } else {
            ctx.set_timer("tick", self.watermarks.last().timestamp() + TICK_MILLIS);
        }
        Ok(())
    }
}

/// Replaces every number by its square.
struct Square;

#[async_trait]
impl Computation for Square {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_arity("square", 1, 1)
    }

    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        _input_stream: &str,
        record: &LogRecord,
    ) -> Result<()> {
        let text = std::str::from_utf8(record.record.data())
            .map_err(|e| Error::Codec(format!("{}: {e}", record.partition)))?;
        let value: i64 = text
            .parse()
            .map_err(|e| Error::Codec(format!("{}: {text:?} {e}", record.partition)))?;
        let squared = value
            .checked_mul(value)
            .ok_or_else(|| Error::Computation(format!("{value} squared overflows")))?;
        ctx.produce_record(
            "o1",
            Record::new(record.record.key(), squared.to_string())
                .with_watermark(record.record.watermark()),
        )?;
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

/// Count and sum of the values seen per key.
#[derive(Clone, Default)]
pub struct Totals(Arc<Mutex<BTreeMap<String, (u64, i128)>>>);

impl Totals {
    pub fn snapshot(&self) -> BTreeMap<String, (u64, i128)> {
        self.0.lock().clone()
    }
}

struct Counter {
    totals: Totals,
}

#[async_trait]
impl BatchComputation for Counter {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_arity("counter", 1, 0)
    }

    async fn batch_process(
        &mut self,
        _ctx: &mut ComputationContext,
        _input_stream: &str,
        records: &[LogRecord],
    ) -> Result<()> {
        let mut totals = self.totals.0.lock();
        for log_record in records {
            let record = &log_record.record;
            let value: i128 = std::str::from_utf8(record.data())
                .ok()
                .and_then(|text| text.parse().ok())
                .unwrap_or_default();
            let (count, sum) = totals.entry(record.key().to_string()).or_default();
            *count += 1;
            *sum += value;
        }
        debug!(records = records.len(), "Batch counted");
        Ok(())
    }
}

/// generator -> square -> counter, `count` records spread over `partitions` partitions.
pub fn topology(
    sequencer: Arc<dyn Sequencer>,
    totals: Totals,
    count: usize,
    partitions: u16,
) -> Result<Topology> {
    let topology = Topology::builder()
        .add_stream(GENERATED, partitions)
        .add_stream(SQUARED, partitions)
        .add_computation(
            move || Generator {
                sequencer: Arc::clone(&sequencer),
                remaining: count,
                watermarks: MonotonicGenerator::new(),
            },
            &["o1:generated"],
        )
        .add_computation(|| Square, &["i1:generated", "o1:squared"])
        .add_computation(
            move || {
                Batched::new(Counter {
                    totals: totals.clone(),
                })
            },
            &["i1:squared"],
        )
        .build()?;
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use logflow_core::{MemoryLog, Settings, StreamProcessor};
    use logflow_sequencer::KVSequencer;
    use logflow_shared::kv::memory::MemoryKVStore;

    use super::*;

    #[tokio::test]
    async fn demo_counts_every_record() {
        let sequencer = Arc::new(KVSequencer::new(Arc::new(MemoryKVStore::new("sequences"))));
        let totals = Totals::default();
        let topology = topology(sequencer, totals.clone(), 200, 3).unwrap();
        let settings = Settings::default()
            .with_max_wait(Duration::from_millis(10))
            .with_checkpoint_thresholds(1, Duration::from_millis(10));

        let mut processor = StreamProcessor::new(Arc::new(MemoryLog::new()), topology, settings);
        processor.start().await.unwrap();
        assert!(
            processor
                .drain_and_stop(Duration::from_secs(10))
                .await
                .unwrap()
        );

        let snapshot = totals.snapshot();
        assert_eq!(snapshot.len(), KEYS as usize);
        let count: u64 = snapshot.values().map(|(count, _)| count).sum();
        assert!(count >= 200);
        assert!(processor.low_watermark("counter").is_completed());
    }
}
