//! Computations running bulk commands on top of the stream engine.
//!
//! ```text
//!   submit ──► bulk-command ──► scheduler ──► bulk-action ──► action computations
//!                                   │                                │
//!                                   └──────► bulk-status ◄───────────┘
//!                                                 │
//!                                               status ──► KV store
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use logflow_core::topology::TopologyBuilder;
use logflow_core::{Computation, ComputationContext, ComputationMetadata, LogRecord, Result};
use logflow_shared::kv::KVStore;
use tracing::{debug, info};

use crate::codec::BulkCodecs;
use crate::error::Error;
use crate::service::{ACTION_STREAM, COMMAND_STREAM, STATUS_STREAM, StatusEntry, status_key};
use crate::status::{BulkState, BulkStatus};

pub const SCHEDULER: &str = "bulk-scheduler";
pub const STATUS: &str = "bulk-status-aggregator";

/// Hands every admitted command over to the actions and reports it as running.
pub struct SchedulerComputation {
    codecs: BulkCodecs,
}

impl SchedulerComputation {
    pub fn new(codecs: BulkCodecs) -> Self {
        Self { codecs }
    }
}

#[async_trait]
impl Computation for SchedulerComputation {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_arity(SCHEDULER, 1, 2)
    }

    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        _input_stream: &str,
        record: &LogRecord,
    ) -> Result<()> {
        let command = self.codecs.decode_command(&record.record)?;
        ctx.produce_record("o1", record.record.clone())?;
        let running = BulkStatus::delta(&command.id).running(Utc::now());
        ctx.produce_record("o2", self.codecs.status_record(&running)?)?;
        ctx.ask_for_checkpoint();
        debug!(command = %command.id, action = %command.action, "Bulk command scheduled");
        Ok(())
    }
}

/// Folds the status deltas into the aggregated status kept in the store.
///
/// Deltas of a command all come from the same partition, in order. The offset of the last
/// applied delta is stored along with the status, a delta at or below it is a replay and is
/// skipped, which keeps the counts exact under at-least-once delivery.
pub struct StatusComputation {
    store: Arc<dyn KVStore>,
    codecs: BulkCodecs,
}

impl StatusComputation {
    pub fn new(store: Arc<dyn KVStore>, codecs: BulkCodecs) -> Self {
        Self { store, codecs }
    }

    async fn apply(&self, partition: u16, offset: i64, delta: &BulkStatus) -> crate::Result<()> {
        let key = status_key(&delta.command_id);
        loop {
            let stored = self
                .store
                .get(&key)
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
            let mut entry = match &stored {
                Some(data) => StatusEntry::decode(data)?,
                None => StatusEntry::default(),
            };
            if entry
                .applied
                .get(&partition)
                .is_some_and(|applied| *applied >= offset)
            {
                debug!(command = %delta.command_id, partition, offset, "Status delta already applied");
                return Ok(());
            }

            let before = entry.status.state;
            entry.status = entry.status.merge(delta).promote(Utc::now());
            entry.applied.insert(partition, offset);
            let updated = self
                .store
                .compare_and_set(&key, stored, entry.encode()?)
                .await
                .map_err(|e| Error::Store(e.to_string()))?;
            if updated {
                if entry.status.state != before {
                    info!(status = %entry.status, "Bulk command {}", state_verb(entry.status.state));
                }
                return Ok(());
            }
        }
    }
}

fn state_verb(state: BulkState) -> &'static str {
    match state {
        BulkState::Scheduled => "scheduled",
        BulkState::Running => "started",
        BulkState::Completed => "completed",
        BulkState::Aborted => "aborted",
    }
}

#[async_trait]
impl Computation for StatusComputation {
    fn metadata(&self) -> ComputationMetadata {
        ComputationMetadata::with_arity(STATUS, 1, 0)
    }

    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        _input_stream: &str,
        record: &LogRecord,
    ) -> Result<()> {
        let delta = self.codecs.decode_status(&record.record)?;
        self.apply(record.partition.partition, record.offset, &delta)
            .await?;
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

/// Declares the bulk streams, each with `partitions` partitions, and adds the scheduler and the
/// status aggregation. Action computations read [ACTION_STREAM] and report to [STATUS_STREAM].
pub fn with_bulk_computations(
    builder: TopologyBuilder,
    store: Arc<dyn KVStore>,
    codecs: BulkCodecs,
    partitions: u16,
) -> TopologyBuilder {
    let commands = format!("i1:{COMMAND_STREAM}");
    let actions = format!("o1:{ACTION_STREAM}");
    let statuses = format!("o2:{STATUS_STREAM}");
    let deltas = format!("i1:{STATUS_STREAM}");
    let scheduler_codecs = codecs.clone();
    builder
        .add_stream(COMMAND_STREAM, partitions)
        .add_stream(ACTION_STREAM, partitions)
        .add_stream(STATUS_STREAM, partitions)
        .add_computation(
            move || SchedulerComputation::new(scheduler_codecs.clone()),
            &[&commands, &actions, &statuses],
        )
        .add_computation(
            move || StatusComputation::new(Arc::clone(&store), codecs.clone()),
            &[&deltas],
        )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use logflow_core::codec::JSON;
    use logflow_core::computation::StreamMapping;
    use logflow_core::{ComputationPolicy, LogPartition, Record};
    use logflow_shared::kv::memory::MemoryKVStore;

    use super::*;
    use crate::command::BulkCommand;

    fn codecs() -> BulkCodecs {
        BulkCodecs::new(&BulkCodecs::registry(), JSON).unwrap()
    }

    fn context(name: &str, outputs: &[&str]) -> ComputationContext {
        ComputationContext::new(
            name,
            0,
            Arc::new(StreamMapping::default()),
            Arc::new(outputs.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()),
            ComputationPolicy::default(),
        )
    }

    fn delta_record(codecs: &BulkCodecs, offset: i64, delta: &BulkStatus) -> LogRecord {
        LogRecord::new(
            LogPartition::new(STATUS_STREAM, 0),
            offset,
            codecs.status_record(delta).unwrap(),
        )
    }

    async fn stored(store: &MemoryKVStore, id: &str) -> BulkStatus {
        let data = store.get(&status_key(id)).await.unwrap().unwrap();
        StatusEntry::decode(&data).unwrap().status
    }

    #[tokio::test]
    async fn scheduler_forwards_and_reports_running() {
        let codecs = codecs();
        let mut scheduler = SchedulerComputation::new(codecs.clone());
        let mut ctx = context(SCHEDULER, &["o1", "o2"]);
        let command = BulkCommand::builder("export", "q", "u").build();
        let record = LogRecord::new(
            LogPartition::new(COMMAND_STREAM, 0),
            0,
            codecs.command_record(&command).unwrap(),
        );
        scheduler
            .process_record(&mut ctx, "i1", &record)
            .await
            .unwrap();
        assert!(ctx.take_checkpoint_request());

        let produced = ctx.take_produced();
        assert_eq!(produced.len(), 2);
        let (stream, forwarded) = &produced[0];
        assert_eq!((stream.as_str(), forwarded.data()), ("o1", record.record.data()));
        let (stream, running) = &produced[1];
        assert_eq!(stream, "o2");
        let running = codecs.decode_status(running).unwrap();
        assert_eq!(running.command_id, command.id);
        assert_eq!(running.state, BulkState::Running);
        assert!(running.started_at.is_some());
    }

    #[tokio::test]
    async fn scheduler_rejects_garbage_as_poison() {
        let mut scheduler = SchedulerComputation::new(codecs());
        let mut ctx = context(SCHEDULER, &["o1", "o2"]);
        let record = LogRecord::new(
            LogPartition::new(COMMAND_STREAM, 0),
            0,
            Record::new("k", "garbage"),
        );
        let err = scheduler
            .process_record(&mut ctx, "i1", &record)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn replayed_deltas_are_not_counted_twice() {
        let codecs = codecs();
        let store = MemoryKVStore::new("bulk");
        let mut status = StatusComputation::new(Arc::new(store.clone()), codecs.clone());
        let mut ctx = context(STATUS, &[]);

        let running = BulkStatus::delta("c1").running(Utc::now()).total(4);
        let progress = BulkStatus::delta("c1").processed(2).result("bytes", 10);
        for (offset, delta) in [(0, &running), (1, &progress), (1, &progress), (0, &running)] {
            status
                .process_record(&mut ctx, "i1", &delta_record(&codecs, offset, delta))
                .await
                .unwrap();
        }
        let current = stored(&store, "c1").await;
        assert_eq!(current.state, BulkState::Running);
        assert_eq!((current.processed, current.total), (2, 4));

        status
            .process_record(&mut ctx, "i1", &delta_record(&codecs, 2, &progress))
            .await
            .unwrap();
        let current = stored(&store, "c1").await;
        assert_eq!(current.state, BulkState::Completed);
        assert_eq!(current.result.get("bytes"), Some(&logflow_core::Value::Int(20)));
        assert!(current.completed_at.is_some());
    }

    #[tokio::test]
    async fn store_failures_are_retryable() {
        let codecs = codecs();
        let store = MemoryKVStore::new("bulk");
        store.error_injector().fail_gets(1);
        let mut status = StatusComputation::new(Arc::new(store.clone()), codecs.clone());
        let mut ctx = context(STATUS, &[]);
        let record = delta_record(&codecs, 0, &BulkStatus::delta("c1").processed(1));

        let err = status
            .process_record(&mut ctx, "i1", &record)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        status.process_record(&mut ctx, "i1", &record).await.unwrap();
        assert_eq!(stored(&store, "c1").await.processed, 1);
    }
}
