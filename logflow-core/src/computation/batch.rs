use async_trait::async_trait;
use chrono::Utc;

use crate::computation::{Computation, ComputationContext, ComputationMetadata};
use crate::config::BatchPolicy;
use crate::error::Result;
use crate::record::{LogRecord, Record};

const BATCH_TIMER: &str = "logflow.batch";

/// A computation handling its input by batches instead of one record at a time.
#[async_trait]
pub trait BatchComputation: Send {
    fn metadata(&self) -> ComputationMetadata;

    async fn init(&mut self, _ctx: &mut ComputationContext) -> Result<()> {
        Ok(())
    }

    /// `records` all come from `input_stream`, in read order.
    async fn batch_process(
        &mut self,
        ctx: &mut ComputationContext,
        input_stream: &str,
        records: &[LogRecord],
    ) -> Result<()>;

    async fn destroy(&mut self) {}
}

/// Adapts a [BatchComputation] into a [Computation]. Records are buffered until the batch
/// capacity is reached or the batch threshold elapsed, then handed over, and a checkpoint is
/// requested only once a batch went through. The [BatchPolicy] comes from the computation
/// policy unless set explicitly.
pub struct Batched<B> {
    inner: B,
    policy: Option<BatchPolicy>,
    buffer: Vec<(String, LogRecord)>,
    /// the last flush failed, the record being replayed is already buffered
    flush_pending: bool,
}

impl<B: BatchComputation> Batched<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            policy: None,
            buffer: Vec::new(),
            flush_pending: false,
        }
    }

    pub fn with_policy(inner: B, policy: BatchPolicy) -> Self {
        Self {
            policy: Some(policy),
            ..Self::new(inner)
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn policy(&self) -> BatchPolicy {
        self.policy.clone().unwrap_or_default()
    }

    async fn flush(&mut self, ctx: &mut ComputationContext) -> Result<()> {
        self.flush_pending = true;
        for group in self.buffer.chunk_by(|(a, _), (b, _)| a == b) {
            let Some((stream, _)) = group.first() else {
                continue;
            };
            let records: Vec<LogRecord> = group.iter().map(|(_, record)| record.clone()).collect();
            self.inner.batch_process(ctx, stream, &records).await?;
        }
        self.buffer.clear();
        self.flush_pending = false;
        ctx.cancel_timer(BATCH_TIMER);
        ctx.ask_for_checkpoint();
        Ok(())
    }
}

#[async_trait]
impl<B: BatchComputation> Computation for Batched<B> {
    fn metadata(&self) -> ComputationMetadata {
        self.inner.metadata()
    }

    async fn init(&mut self, ctx: &mut ComputationContext) -> Result<()> {
        if self.policy.is_none() {
            self.policy = Some(ctx.policy().batch.clone());
        }
        self.inner.init(ctx).await
    }

    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        input_stream: &str,
        record: &LogRecord,
    ) -> Result<()> {
        let policy = self.policy();
        if !self.flush_pending {
            if self.buffer.is_empty() {
                let deadline = Utc::now().timestamp_millis() + policy.threshold_ms as i64;
                ctx.set_timer(BATCH_TIMER, deadline);
            }
            self.buffer.push((input_stream.to_string(), record.clone()));
        }
        if self.buffer.len() >= policy.capacity.max(1) {
            self.flush(ctx).await?;
        }
        Ok(())
    }

    async fn process_timer(
        &mut self,
        ctx: &mut ComputationContext,
        key: &str,
        _timestamp: i64,
    ) -> Result<()> {
        if key == BATCH_TIMER && !self.buffer.is_empty() {
            self.flush(ctx).await?;
        }
        Ok(())
    }

    fn discard_pending(&mut self) -> Vec<Record> {
        self.flush_pending = false;
        self.buffer.drain(..).map(|(_, buffered)| buffered.record).collect()
    }

    async fn destroy(&mut self) {
        self.inner.destroy().await;
    }
}
