//! [StreamProcessor] owns the tasks of a [Topology]: one task per computation and partition,
//! all sharing a cancellation token. Any task failing with a non task-local error cancels
//! the token, which halts the whole topology.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::CodecRegistry;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::log::{Log, LogLag};
use crate::record::Record;
use crate::runner::{ComputationRunner, TaskStatus};
use crate::topology::{Topology, task_id};
use crate::watermark::Watermark;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct TaskHandle {
    computation: String,
    status: watch::Receiver<TaskStatus>,
}

pub struct StreamProcessor {
    log: Arc<dyn Log>,
    topology: Arc<Topology>,
    settings: Arc<Settings>,
    cancel: CancellationToken,
    tasks: JoinSet<(String, Result<()>)>,
    handles: BTreeMap<String, TaskHandle>,
    failures: Vec<Error>,
    started: bool,
}

impl StreamProcessor {
    pub fn new(log: Arc<dyn Log>, topology: Topology, settings: Settings) -> Self {
        Self {
            log,
            topology: Arc::new(topology),
            settings: Arc::new(settings),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            handles: BTreeMap::new(),
            failures: Vec::new(),
            started: false,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Token cancelled when the processor stops or a task halts the topology.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Creates the streams of the topology (and the dead-letter streams of its computations)
    /// and starts every task.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Processor("already started".to_string()));
        }
        self.started = true;
        self.check_input_codecs()?;

        for (stream, partitions) in self.topology.streams() {
            if self.log.create_stream(stream, *partitions).await? {
                info!(%stream, partitions, "Stream created");
            }
            self.apply_codec(stream).await?;
        }
        for metadata in self.topology.computations() {
            let name = metadata.name();
            let dead_letter = self.settings.policy(name).dead_letter_stream_for(name);
            if self.topology.partitions(&dead_letter).is_some() {
                continue;
            }
            if self
                .log
                .create_stream(&dead_letter, self.settings.default_partitions)
                .await?
            {
                info!(stream = %dead_letter, computation = name, "Dead-letter stream created");
            }
            self.apply_codec(&dead_letter).await?;
        }

        let computations: Vec<String> = self
            .topology
            .computations()
            .map(|metadata| metadata.name().to_string())
            .collect();
        for computation in computations {
            for partition in 0..self.topology.task_count(&computation) {
                let (status_tx, status_rx) = watch::channel(TaskStatus::default());
                let runner = ComputationRunner::new(
                    &self.topology,
                    &computation,
                    partition,
                    Arc::clone(&self.log),
                    Arc::clone(&self.settings),
                    self.cancel.clone(),
                    status_tx,
                )?;
                let id = task_id(&computation, partition);
                self.handles.insert(
                    id.clone(),
                    TaskHandle {
                        computation: computation.clone(),
                        status: status_rx,
                    },
                );
                self.tasks.spawn(async move { (id, runner.run().await) });
            }
        }
        info!(tasks = self.handles.len(), "Stream processor started");
        Ok(())
    }

    /// A task decodes all of its inputs the same way, a computation cannot mix input codecs.
    fn check_input_codecs(&self) -> Result<()> {
        for metadata in self.topology.computations() {
            let codecs: BTreeSet<&str> = metadata
                .inputs()
                .iter()
                .map(|stream| self.settings.codec_for(stream))
                .collect();
            if codecs.len() > 1 {
                return Err(Error::Config(format!(
                    "computation {} reads streams with different codecs: {}",
                    metadata.name(),
                    codecs.into_iter().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Streams without a codec override keep the default codec of the log.
    async fn apply_codec(&self, stream: &str) -> Result<()> {
        let Some(name) = self.settings.codecs.get(stream) else {
            return Ok(());
        };
        let codec = CodecRegistry::with_defaults().get::<Record>(name)?;
        self.log.set_codec(stream, codec).await?;
        info!(%stream, codec = %name, "Stream codec set");
        Ok(())
    }

    /// Waits until every task has restored its checkpoints and initialized its computation.
    /// Returns false on timeout.
    pub async fn wait_for_assignments(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        for handle in self.handles.values() {
            let mut status = handle.status.clone();
            let assigned = async move {
                // a dropped sender means the task is gone
                let _ = status
                    .wait_for(|status| status.assigned || status.terminated)
                    .await
                    .map(|_| ());
            };
            if tokio::time::timeout_at(deadline, assigned).await.is_err() {
                return Ok(false);
            }
        }
        self.reap()?;
        Ok(true)
    }

    /// Waits for the sources to terminate and for every computation to consume all of its
    /// input, then stops. Returns false when that did not happen within `timeout`.
    pub async fn drain_and_stop(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Err(e) = self.reap() {
                self.stop(deadline.saturating_duration_since(Instant::now()))
                    .await?;
                return Err(e);
            }
            if self.is_drained().await? {
                info!("Topology drained");
                return self
                    .stop(deadline.saturating_duration_since(Instant::now()))
                    .await;
            }
            if Instant::now() >= deadline {
                warn!(?timeout, "Topology not drained in time, stopping");
                self.stop(Duration::ZERO).await?;
                return Ok(false);
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn is_drained(&self) -> Result<bool> {
        let sources_done = self
            .topology
            .computations()
            .filter(|metadata| metadata.is_source())
            .all(|metadata| {
                self.statuses(metadata.name())
                    .all(|status| status.terminated)
            });
        if !sources_done {
            return Ok(false);
        }
        for metadata in self.topology.computations() {
            if metadata.is_source() {
                continue;
            }
            if self.lag(metadata.name()).await?.lag() > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cancels every task, letting it finish its current record and commit a final checkpoint.
    /// Tasks still running after `timeout` are aborted and false is returned. The first task
    /// failure, if any, is returned as an error.
    pub async fn stop(&mut self, timeout: Duration) -> Result<bool> {
        self.cancel.cancel();
        let deadline = Instant::now() + timeout;
        let mut graceful = true;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.record(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.tasks.len(), "Tasks did not stop in time, aborting");
                    self.shutdown().await;
                    graceful = false;
                    break;
                }
            }
        }
        match self.failures.first() {
            Some(e) => Err(e.clone()),
            None => {
                info!(graceful, "Stream processor stopped");
                Ok(graceful)
            }
        }
    }

    /// Aborts every task without waiting for checkpoints.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }

    /// Low watermark of a computation: the lowest of its tasks.
    pub fn low_watermark(&self, computation: &str) -> Watermark {
        self.statuses(computation)
            .map(|status| status.low_watermark)
            .min()
            .unwrap_or(Watermark::LOWEST)
    }

    /// Lowest watermark over all computations.
    pub fn topology_low_watermark(&self) -> Watermark {
        self.topology
            .computations()
            .map(|metadata| self.low_watermark(metadata.name()))
            .min()
            .unwrap_or(Watermark::LOWEST)
    }

    /// Records of the computation inputs not yet covered by a checkpoint.
    pub async fn lag(&self, computation: &str) -> Result<LogLag> {
        let metadata = self
            .topology
            .metadata(computation)
            .ok_or_else(|| Error::Processor(format!("unknown computation {computation}")))?;
        let mut lag = LogLag::default();
        for stream in metadata.inputs() {
            lag = lag.merge(self.log.lag(computation, stream).await?);
        }
        Ok(lag)
    }

    /// True once every task has exited.
    pub fn is_terminated(&self) -> bool {
        self.started
            && self
                .handles
                .values()
                .all(|handle| handle.status.borrow().terminated)
    }

    fn statuses<'a>(&'a self, computation: &'a str) -> impl Iterator<Item = TaskStatus> + 'a {
        self.handles
            .values()
            .filter(move |handle| handle.computation == computation)
            .map(|handle| *handle.status.borrow())
    }

    /// Collects the tasks that already exited and surfaces the first failure.
    fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
        match self.failures.first() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn record(&mut self, joined: std::result::Result<(String, Result<()>), tokio::task::JoinError>) {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((id, Err(e))) => {
                error!(task = %id, error = %e, "Task failed");
                self.failures.push(e);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!(error = %e, "Task panicked");
                self.failures.push(e.into());
            }
        }
    }
}
