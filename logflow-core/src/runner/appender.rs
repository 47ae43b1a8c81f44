//! Produced records are appended by a dedicated task fed through a bounded channel. The channel
//! capacity is the backpressure limit: once it is full the computation task blocks on
//! [Appender::send] and stops polling its inputs until the log catches up.

use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::CheckpointSettings;
use crate::error::{Error, Result};
use crate::log::{Log, LogError};
use crate::metrics::runner_metrics;
use crate::record::Record;

struct PendingAppend {
    stream: String,
    partition: u16,
    record: Record,
}

pub(crate) struct Appender {
    tx: Option<mpsc::Sender<PendingAppend>>,
    /// number of records acknowledged by the log so far
    acked: watch::Receiver<u64>,
    sent: u64,
    handle: Option<JoinHandle<Result<()>>>,
    labels: Vec<(String, String)>,
}

impl Appender {
    pub(crate) fn spawn(
        log: Arc<dyn Log>,
        capacity: usize,
        retry: CheckpointSettings,
        labels: Vec<(String, String)>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (acked_tx, acked) = watch::channel(0);
        let handle = tokio::spawn(Self::run(log, rx, acked_tx, retry, labels.clone()));
        Self {
            tx: Some(tx),
            acked,
            sent: 0,
            handle: Some(handle),
            labels,
        }
    }

    async fn run(
        log: Arc<dyn Log>,
        mut rx: mpsc::Receiver<PendingAppend>,
        acked_tx: watch::Sender<u64>,
        retry: CheckpointSettings,
        labels: Vec<(String, String)>,
    ) -> Result<()> {
        let mut acked = 0;
        while let Some(pending) = rx.recv().await {
            append_with_retry(&log, pending, &retry).await?;
            acked += 1;
            acked_tx.send_replace(acked);
            runner_metrics().produced_total.get_or_create(&labels).inc();
        }
        Ok(())
    }

    pub(crate) fn is_full(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.capacity() == 0)
    }

    pub(crate) fn pending(&self) -> u64 {
        self.sent.saturating_sub(*self.acked.borrow())
    }

    /// Queues a record, waiting for room when the queue is full.
    pub(crate) async fn send(&mut self, stream: String, partition: u16, record: Record) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(Error::Log(LogError::Append("appender is closed".to_string())));
        };
        if tx.capacity() == 0 {
            runner_metrics()
                .backpressure_total
                .get_or_create(&self.labels)
                .inc();
        }
        let pending = PendingAppend {
            stream,
            partition,
            record,
        };
        if tx.send(pending).await.is_err() {
            return Err(self.failure().await);
        }
        self.sent += 1;
        runner_metrics()
            .pending_appends
            .get_or_create(&self.labels)
            .set(self.pending() as i64);
        Ok(())
    }

    /// Waits until every queued record is durably appended.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        let sent = self.sent;
        let drained = self.acked.wait_for(|acked| *acked >= sent).await.is_ok();
        if !drained {
            return Err(self.failure().await);
        }
        runner_metrics()
            .pending_appends
            .get_or_create(&self.labels)
            .set(0);
        Ok(())
    }

    /// Drains the queue and stops the append task.
    pub(crate) async fn close(&mut self) -> Result<()> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// Error that stopped the append task.
    async fn failure(&mut self) -> Error {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => Error::Log(LogError::Append("appender stopped".to_string())),
                Err(e) => e.into(),
            },
            None => Error::Log(LogError::Append("appender stopped".to_string())),
        }
    }
}

/// Unknown streams and encoding failures will not get better with time.
fn is_transient(error: &LogError) -> bool {
    !matches!(
        error,
        LogError::UnknownStream(_) | LogError::UnknownPartition { .. } | LogError::Codec(_)
    )
}

async fn append_with_retry(
    log: &Arc<dyn Log>,
    pending: PendingAppend,
    retry: &CheckpointSettings,
) -> Result<()> {
    let timeout = retry.timeout();
    let strategy = Exponential::from_millis(retry.retry_delay_ms)
        .max_delay(Duration::from_secs(1))
        .max_retries(retry.max_retries);
    let PendingAppend {
        stream,
        partition,
        record,
    } = pending;
    let operation = || {
        let log = Arc::clone(log);
        let stream = stream.clone();
        let record = record.clone();
        async move {
            match tokio::time::timeout(timeout, log.append(&stream, partition, record)).await {
                Ok(result) => result,
                Err(_) => Err(LogError::Append(format!("timed out after {timeout:?}"))),
            }
        }
    };
    let condition = |error: &LogError, attempt: usize| {
        let transient = is_transient(error);
        if transient {
            warn!(%error, attempt, stream = %stream, partition, "Append failed, retrying");
        }
        transient
    };
    Retry::new(strategy, operation, condition)
        .await
        .map(|_| ())
        .map_err(Error::Log)
}
