//! A [ComputationRunner] drives one computation instance on one partition. It reads partition
//! `p` of every input stream (sources read nothing), feeds records and timers to the
//! computation, appends what it produces and commits checkpoints.
//!
//! ```text
//!   restore checkpoints --> init --> +--> fire due timers
//!                                    |        |
//!                                    |    poll inputs (fair, bounded wait)
//!                                    |        |
//!                                    |    process each record (retry / dead-letter / halt)
//!                                    |        |
//!                                    |    emit completion marker once inputs are complete
//!                                    |        |
//!                                    +--- checkpoint when due
//!   cancelled or terminated --> forced checkpoint --> destroy
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::computation::{Computation, ComputationContext};
use crate::config::{CheckpointSettings, ComputationPolicy, Settings};
use crate::error::{Error, Result};
use crate::log::{Checkpoint, Log, LogError, LogPartition, determine_partition};
use crate::metrics::{runner_metrics, stream_labels, task_labels};
use crate::record::{LogRecord, Record, flags};
use crate::topology::{Topology, task_id};
use crate::watermark::Watermark;
use crate::watermark::tracker::WatermarkTracker;

mod appender;

use appender::Appender;

/// Progress of a task, published for the processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskStatus {
    /// restored its checkpoints and initialized the computation
    pub assigned: bool,
    pub low_watermark: Watermark,
    /// sent its completion marker downstream
    pub completed: bool,
    pub terminated: bool,
}

struct InputCursor {
    partition: LogPartition,
    /// the stream name the computation knows this input by
    logical: String,
    next_offset: i64,
    /// position that may be committed, everything below it is fully processed
    checkpointable: i64,
    committed: i64,
    /// offset of the marker that completed the partition
    completed_at: Option<i64>,
}

#[derive(Clone, Copy)]
enum Invocation<'a> {
    Record { input: &'a str, record: &'a LogRecord },
    Timer { key: &'a str, timestamp: i64 },
}

pub(crate) struct ComputationRunner {
    name: String,
    partition: u16,
    task_id: String,
    is_source: bool,
    computation: Box<dyn Computation>,
    ctx: ComputationContext,
    log: Arc<dyn Log>,
    settings: Arc<Settings>,
    policy: ComputationPolicy,
    dead_letter_stream: (String, u16),
    inputs: Vec<InputCursor>,
    outputs: Vec<(String, u16)>,
    tracker: WatermarkTracker,
    appender: Appender,
    status: watch::Sender<TaskStatus>,
    cancel: CancellationToken,
    labels: Vec<(String, String)>,
    records_since_checkpoint: usize,
    last_checkpoint: Instant,
    next_input: usize,
    completion_sent: bool,
}

impl ComputationRunner {
    pub(crate) fn new(
        topology: &Topology,
        computation: &str,
        partition: u16,
        log: Arc<dyn Log>,
        settings: Arc<Settings>,
        cancel: CancellationToken,
        status: watch::Sender<TaskStatus>,
    ) -> Result<Self> {
        let node = topology
            .node(computation)
            .ok_or_else(|| Error::Processor(format!("unknown computation {computation}")))?;
        let metadata = &node.metadata;

        let mut inputs = Vec::new();
        let mut tracker = WatermarkTracker::new();
        for stream in metadata.inputs() {
            let partitions = topology.partitions(stream).unwrap_or_default();
            if partition >= partitions {
                continue;
            }
            let log_partition = LogPartition::new(stream.clone(), partition);
            tracker.track(log_partition.clone(), topology.producer_tasks(stream));
            inputs.push(InputCursor {
                partition: log_partition,
                logical: node.mapping.logical(stream).to_string(),
                next_offset: 0,
                checkpointable: 0,
                committed: 0,
                completed_at: None,
            });
        }
        let outputs: Vec<(String, u16)> = metadata
            .outputs()
            .iter()
            .map(|stream| (stream.clone(), topology.partitions(stream).unwrap_or(1)))
            .collect();
        let output_names: BTreeSet<String> = outputs.iter().map(|(s, _)| s.clone()).collect();

        let policy = settings.policy(computation).clone();
        let dead_letter = policy.dead_letter_stream_for(computation);
        let dead_letter_partitions = topology
            .partitions(&dead_letter)
            .unwrap_or(settings.default_partitions);
        let ctx = ComputationContext::new(
            computation,
            partition,
            Arc::clone(&node.mapping),
            Arc::new(output_names),
            policy.clone(),
        );
        let labels = task_labels(computation, partition);
        let appender = Appender::spawn(
            Arc::clone(&log),
            settings.max_pending_appends,
            settings.checkpoint.clone(),
            labels.clone(),
        );

        Ok(Self {
            name: computation.to_string(),
            partition,
            task_id: task_id(computation, partition),
            is_source: metadata.is_source(),
            computation: (node.supplier)(),
            ctx,
            log,
            settings,
            policy,
            dead_letter_stream: (dead_letter, dead_letter_partitions),
            inputs,
            outputs,
            tracker,
            appender,
            status,
            cancel,
            labels,
            records_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            next_input: 0,
            completion_sent: false,
        })
    }

    /// Runs until cancelled, terminated by the computation or failed. A failure halts the
    /// whole topology unless it only concerns this task (log or checkpoint trouble).
    pub(crate) async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        self.computation.destroy().await;
        let closed = self.appender.close().await;
        self.status.send_modify(|status| status.terminated = true);
        match result {
            Ok(()) => {
                info!(task = %self.task_id, "Task stopped");
                closed
            }
            Err(e) => {
                error!(task = %self.task_id, error = %e, "Task failed");
                if !e.is_task_local() {
                    self.cancel.cancel();
                }
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.restore().await?;
        self.init().await?;
        self.status.send_modify(|status| status.assigned = true);
        info!(
            task = %self.task_id,
            partition = self.partition,
            inputs = self.inputs.len(),
            outputs = self.outputs.len(),
            "Task assigned"
        );

        'processing: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.fire_timers().await {
                Err(Error::Cancelled) => break,
                other => other?,
            }
            if self.ctx.is_termination_requested() {
                break;
            }

            if self.is_source || self.inputs.is_empty() {
                self.idle().await;
            } else {
                let batch = self.poll().await?;
                for (input, record) in batch {
                    match self.handle(input, record).await {
                        Err(Error::Cancelled) => break 'processing,
                        other => other?,
                    }
                    if self.ctx.is_termination_requested() {
                        break;
                    }
                }
            }

            self.maybe_emit_completion().await?;
            self.maybe_checkpoint(false).await?;
            self.publish_status();
        }

        self.maybe_emit_completion().await?;
        self.maybe_checkpoint(true).await?;
        self.publish_status();
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        for cursor in &mut self.inputs {
            if let Some(checkpoint) = self.log.committed(&self.name, &cursor.partition).await? {
                cursor.next_offset = checkpoint.offset;
                cursor.checkpointable = checkpoint.offset;
                cursor.committed = checkpoint.offset;
                self.tracker.restore(&cursor.partition, checkpoint.watermark);
                if checkpoint.watermark.is_completed() {
                    cursor.completed_at = Some(checkpoint.offset - 1);
                }
                debug!(
                    task = %self.task_id,
                    partition = %cursor.partition,
                    offset = checkpoint.offset,
                    "Resuming from checkpoint"
                );
            }
        }
        self.ctx.set_low_watermark(self.tracker.low_watermark());
        Ok(())
    }

    async fn init(&mut self) -> Result<()> {
        self.computation
            .init(&mut self.ctx)
            .await
            .map_err(|e| Error::Computation(format!("{} init failed: {e}", self.task_id)))?;
        self.flush_produced().await?;
        self.mark_checkpointable();
        Ok(())
    }

    /// Sleeps until the next timer, at most `max_wait`.
    async fn idle(&mut self) {
        let wait = self.next_wait();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    fn next_wait(&self) -> Duration {
        let max_wait = self.settings.max_wait();
        match self.ctx.next_timer() {
            Some(due) => {
                let until = (due - Utc::now().timestamp_millis()).max(0) as u64;
                max_wait.min(Duration::from_millis(until))
            }
            None => max_wait,
        }
    }

    /// Reads up to `max_records` across the inputs, starting with a different input on every
    /// call and interleaving partitions so none of them starves the others.
    async fn poll(&mut self) -> Result<Vec<(usize, LogRecord)>> {
        if self.appender.is_full() {
            // backpressure: let the log absorb what is pending before reading more
            self.appender.flush().await?;
        }

        let count = self.inputs.len();
        let share = self.settings.max_records.div_ceil(count).max(1);
        let start = self.next_input;
        self.next_input = (self.next_input + 1) % count;

        let mut fetched = Vec::with_capacity(count);
        for step in 0..count {
            let index = (start + step) % count;
            let records = self.read(index, share, Duration::ZERO).await;
            fetched.push((index, records));
        }
        if fetched.iter().all(|(_, records)| records.is_empty()) {
            let wait = self.next_wait();
            let cancel = self.cancel.clone();
            let records = tokio::select! {
                _ = cancel.cancelled() => Vec::new(),
                records = self.read(start, share, wait) => records,
            };
            fetched = vec![(start, records)];
        }

        let mut iters: Vec<_> = fetched
            .into_iter()
            .map(|(index, records)| (index, records.into_iter()))
            .collect();
        let mut batch = Vec::new();
        loop {
            let before = batch.len();
            for (index, records) in iters.iter_mut() {
                if let Some(record) = records.next() {
                    batch.push((*index, record));
                }
            }
            if batch.len() == before {
                break;
            }
        }
        Ok(batch)
    }

    /// Read failures are logged and retried on the next poll.
    async fn read(&mut self, index: usize, max: usize, wait: Duration) -> Vec<LogRecord> {
        let Some(cursor) = self.inputs.get(index) else {
            return Vec::new();
        };
        match self
            .log
            .read(&cursor.partition, cursor.next_offset, max, wait)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(task = %self.task_id, partition = %cursor.partition, error = %e, "Read failed");
                tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
                Vec::new()
            }
        }
    }

    async fn handle(&mut self, input: usize, log_record: LogRecord) -> Result<()> {
        runner_metrics().read_total.get_or_create(&self.labels).inc();
        self.records_since_checkpoint += 1;
        let (partition, offset) = (log_record.partition.clone(), log_record.offset);
        let record = &log_record.record;

        if record.is_control() {
            self.tracker
                .complete(&partition, record.key(), record.watermark());
            if self.tracker.is_partition_completed(&partition)
                && let Some(cursor) = self.inputs.get_mut(input)
                && cursor.completed_at.is_none()
            {
                cursor.completed_at = Some(offset);
            }
            self.advance(input, offset, false);
            return Ok(());
        }
        if record.is_poison() {
            warn!(task = %self.task_id, %partition, offset, "Undecodable record");
            self.dead_letter(
                vec![log_record.record],
                &format!("{partition}@{offset}"),
                "undecodable record",
            )
            .await?;
            self.advance(input, offset, false);
            return Ok(());
        }

        self.tracker.observe(&partition, record.watermark());
        self.ctx.set_low_watermark(self.tracker.low_watermark());
        let logical = self
            .inputs
            .get(input)
            .map(|cursor| cursor.logical.clone())
            .unwrap_or_else(|| partition.stream.clone());

        let start = Instant::now();
        let outcome = self
            .invoke(Invocation::Record {
                input: &logical,
                record: &log_record,
            })
            .await;
        match outcome {
            Ok(()) => {
                runner_metrics()
                    .processing_time
                    .get_or_create(&self.labels)
                    .observe(start.elapsed().as_micros() as f64);
                runner_metrics().processed_total.get_or_create(&self.labels).inc();
                self.flush_produced().await?;
                self.advance(input, offset, true);
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.on_failure(Some(log_record.record), e, &format!("{partition}@{offset}"))
                    .await?;
                self.advance(input, offset, true);
                Ok(())
            }
        }
    }

    /// Moves past `offset`. After a successful callback a requested checkpoint covers every
    /// input; records handled by the engine alone only become checkpointable when nothing
    /// before them is pending.
    fn advance(&mut self, input: usize, offset: i64, processed: bool) {
        if let Some(cursor) = self.inputs.get_mut(input) {
            cursor.next_offset = offset + 1;
            if !processed && cursor.checkpointable == offset {
                cursor.checkpointable = offset + 1;
            }
        }
        if processed {
            self.mark_checkpointable();
        }
    }

    fn mark_checkpointable(&mut self) {
        if self.ctx.take_checkpoint_request() {
            for cursor in &mut self.inputs {
                cursor.checkpointable = cursor.next_offset;
            }
        }
    }

    async fn fire_timers(&mut self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        for (key, timestamp) in self.ctx.take_due_timers(now) {
            self.ctx.set_low_watermark(self.tracker.low_watermark());
            let outcome = self
                .invoke(Invocation::Timer {
                    key: &key,
                    timestamp,
                })
                .await;
            match outcome {
                Ok(()) => {
                    self.flush_produced().await?;
                    self.mark_checkpointable();
                }
                Err(Error::Cancelled) => {
                    // fired again on the next run
                    self.ctx.set_timer(key, timestamp);
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    self.on_failure(None, e, &format!("timer {key}")).await?;
                    self.mark_checkpointable();
                }
            }
            if self.ctx.is_termination_requested() {
                break;
            }
        }
        Ok(())
    }

    /// Calls the computation, replaying the callback as the retry policy allows. A failed
    /// attempt leaves no trace in the context.
    async fn invoke(&mut self, invocation: Invocation<'_>) -> Result<()> {
        let mut backoff = self.policy.retry.backoff();
        let mut attempt = 1;
        loop {
            let savepoint = self.ctx.savepoint();
            let result = match invocation {
                Invocation::Record { input, record } => {
                    self.computation
                        .process_record(&mut self.ctx, input, record)
                        .await
                }
                Invocation::Timer { key, timestamp } => {
                    self.computation
                        .process_timer(&mut self.ctx, key, timestamp)
                        .await
                }
            };
            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            self.ctx.rollback(savepoint);
            runner_metrics().failure_total.get_or_create(&self.labels).inc();

            if !error.is_retryable() {
                return Err(error);
            }
            let Some(delay) = backoff.next() else {
                return Err(error);
            };
            warn!(
                task = %self.task_id,
                attempt,
                max_attempts = self.policy.retry.max_attempts(),
                ?delay,
                error = %error,
                "Processing failed, retrying"
            );
            runner_metrics().retry_total.get_or_create(&self.labels).inc();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Retries are exhausted (or pointless): skip to the dead-letter stream when allowed,
    /// otherwise fail so the topology halts.
    async fn on_failure(&mut self, record: Option<Record>, error: Error, what: &str) -> Result<()> {
        if error.is_retryable() && !self.policy.continue_on_failure {
            error!(task = %self.task_id, what, error = %error, "Processing failed, halting");
            return Err(Error::Computation(format!(
                "{} failed on {what}: {error}",
                self.task_id
            )));
        }

        let mut discarded = self.computation.discard_pending();
        if discarded.is_empty()
            && let Some(record) = record
        {
            discarded.push(record);
        }
        self.dead_letter(discarded, what, &error.to_string()).await?;
        // the failure is dealt with, nothing before this point needs replaying
        self.ctx.ask_for_checkpoint();
        Ok(())
    }

    async fn dead_letter(&mut self, records: Vec<Record>, origin: &str, reason: &str) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let (stream, partitions) = self.dead_letter_stream.clone();
        let count = records.len();
        for record in records {
            let partition = determine_partition(record.key(), partitions);
            self.appender
                .send(
                    stream.clone(),
                    partition,
                    record.with_flag(flags::DEAD_LETTER),
                )
                .await?;
        }
        runner_metrics()
            .dead_letter_total
            .get_or_create(&stream_labels(&self.name, &stream))
            .inc_by(count as u64);
        warn!(
            task = %self.task_id,
            %stream,
            count,
            origin,
            reason,
            "Records moved to dead-letter stream"
        );
        Ok(())
    }

    async fn flush_produced(&mut self) -> Result<()> {
        for (stream, record) in self.ctx.take_produced() {
            let partitions = self
                .outputs
                .iter()
                .find(|(name, _)| *name == stream)
                .map_or(1, |(_, partitions)| *partitions);
            let partition = determine_partition(record.key(), partitions);
            self.appender.send(stream, partition, record).await?;
        }
        Ok(())
    }

    fn low_watermark(&self) -> Watermark {
        let low = if self.is_source {
            self.ctx.low_watermark()
        } else {
            self.tracker.low_watermark()
        };
        if self.completion_sent {
            low.completed()
        } else {
            low
        }
    }

    /// Once every input is complete and nothing is buffered (or the computation terminated),
    /// tells every downstream partition that this task is done.
    async fn maybe_emit_completion(&mut self) -> Result<()> {
        if self.completion_sent {
            return Ok(());
        }
        let done = self.ctx.is_termination_requested()
            || (!self.is_source && self.tracker.is_completed() && !self.ctx.has_timers());
        if !done {
            return Ok(());
        }
        let watermark = self.low_watermark().completed();
        for (stream, partitions) in self.outputs.clone() {
            for partition in 0..partitions {
                self.appender
                    .send(
                        stream.clone(),
                        partition,
                        Record::completion_marker(self.task_id.clone(), watermark),
                    )
                    .await?;
            }
        }
        self.completion_sent = true;
        self.status.send_modify(|status| status.completed = true);
        info!(task = %self.task_id, %watermark, "Task completed");
        Ok(())
    }

    async fn maybe_checkpoint(&mut self, force: bool) -> Result<()> {
        let due = force
            || self.records_since_checkpoint >= self.settings.max_records_since_checkpoint
            || self.last_checkpoint.elapsed() >= self.settings.max_duration_since_checkpoint();
        if !due {
            return Ok(());
        }
        self.records_since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
        if self
            .inputs
            .iter()
            .all(|cursor| cursor.checkpointable <= cursor.committed)
        {
            return Ok(());
        }

        // produced records must be durable before the inputs that led to them are committed
        self.appender.flush().await?;
        for cursor in &mut self.inputs {
            if cursor.checkpointable <= cursor.committed {
                continue;
            }
            let mut watermark = self.tracker.max(&cursor.partition);
            if cursor
                .completed_at
                .is_some_and(|marker| marker < cursor.checkpointable)
            {
                watermark = watermark.completed();
            }
            let checkpoint = Checkpoint {
                computation: self.name.clone(),
                partition: cursor.partition.clone(),
                offset: cursor.checkpointable,
                watermark,
            };
            if let Err(e) = commit_with_retry(&self.log, &checkpoint, &self.settings.checkpoint).await
            {
                runner_metrics()
                    .checkpoint
                    .failure_total
                    .get_or_create(&self.labels)
                    .inc();
                return Err(Error::Checkpoint(format!(
                    "{} could not commit {} at {}: {e}",
                    self.task_id, checkpoint.partition, checkpoint.offset
                )));
            }
            cursor.committed = cursor.checkpointable;
            runner_metrics()
                .checkpoint
                .commit_total
                .get_or_create(&self.labels)
                .inc();
            debug!(
                task = %self.task_id,
                partition = %checkpoint.partition,
                offset = checkpoint.offset,
                watermark = %checkpoint.watermark,
                "Checkpoint committed"
            );
        }
        Ok(())
    }

    fn publish_status(&self) {
        let low_watermark = self.low_watermark();
        runner_metrics()
            .low_watermark
            .get_or_create(&self.labels)
            .set(low_watermark.timestamp());
        self.status.send_if_modified(|status| {
            let modified = status.low_watermark != low_watermark;
            status.low_watermark = low_watermark;
            modified
        });
    }
}

/// Commits with a per attempt timeout, retrying with backoff.
async fn commit_with_retry(
    log: &Arc<dyn Log>,
    checkpoint: &Checkpoint,
    settings: &CheckpointSettings,
) -> std::result::Result<(), LogError> {
    let timeout = settings.timeout();
    let strategy = Exponential::from_millis(settings.retry_delay_ms)
        .max_delay(Duration::from_secs(1))
        .max_retries(settings.max_retries);
    let operation = || {
        let log = Arc::clone(log);
        let checkpoint = checkpoint.clone();
        async move {
            match tokio::time::timeout(timeout, log.commit(&checkpoint)).await {
                Ok(result) => result,
                Err(_) => Err(LogError::Commit(format!("timed out after {timeout:?}"))),
            }
        }
    };
    let condition = |error: &LogError, attempt: usize| {
        warn!(
            %error,
            attempt,
            computation = %checkpoint.computation,
            partition = %checkpoint.partition,
            "Checkpoint commit failed, retrying"
        );
        !matches!(
            error,
            LogError::UnknownStream(_) | LogError::UnknownPartition { .. }
        )
    };
    Retry::new(strategy, operation, condition).await
}
