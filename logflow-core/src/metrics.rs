use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};

const COMPUTATION_LABEL: &str = "computation";
const PARTITION_LABEL: &str = "partition";
const STREAM_LABEL: &str = "stream";

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "logflow";
const CHECKPOINT_REGISTRY_PREFIX: &str = "checkpoint";

// counters (the _total suffix is added by the client library)
const READ_TOTAL: &str = "read";
const PROCESSED_TOTAL: &str = "processed";
const PRODUCED_TOTAL: &str = "produced";
const FAILURE_TOTAL: &str = "failure";
const RETRY_TOTAL: &str = "retry";
const DEAD_LETTER_TOTAL: &str = "dead_letter";
const BACKPRESSURE_TOTAL: &str = "backpressure";
const CHECKPOINT_TOTAL: &str = "commit";
const CHECKPOINT_FAILURE_TOTAL: &str = "commit_failure";

// gauges
const PENDING_APPENDS: &str = "pending_appends";
const LOW_WATERMARK: &str = "low_watermark";

// timers
const PROCESSING_TIME: &str = "processing_time";

/// The global register of all metrics.
struct GlobalRegistry {
    // registering happens once, a blocking mutex is fine
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the computation tasks, labelled by computation and partition (plus stream for
/// dead letters).
pub(crate) struct RunnerMetrics {
    pub(crate) read_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) processed_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) produced_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) failure_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) retry_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) dead_letter_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) backpressure_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) pending_appends: Family<Vec<(String, String)>, Gauge>,
    pub(crate) low_watermark: Family<Vec<(String, String)>, Gauge>,
    pub(crate) processing_time: Family<Vec<(String, String)>, Histogram>,
    pub(crate) checkpoint: CheckpointMetrics,
}

pub(crate) struct CheckpointMetrics {
    pub(crate) commit_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) failure_total: Family<Vec<(String, String)>, Counter>,
}

/// Exponential bucket distribution with range, `length` buckets from `min` to `max`. The final
/// +Inf bucket is implicit.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let length = length.max(2);
    let min = min.max(f64::MIN_POSITIVE);
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::successors(Some(min), move |bucket| Some(bucket * growth_factor)).take(length.into())
}

impl RunnerMetrics {
    fn new() -> Self {
        let metrics = Self {
            read_total: Family::<Vec<(String, String)>, Counter>::default(),
            processed_total: Family::<Vec<(String, String)>, Counter>::default(),
            produced_total: Family::<Vec<(String, String)>, Counter>::default(),
            failure_total: Family::<Vec<(String, String)>, Counter>::default(),
            retry_total: Family::<Vec<(String, String)>, Counter>::default(),
            dead_letter_total: Family::<Vec<(String, String)>, Counter>::default(),
            backpressure_total: Family::<Vec<(String, String)>, Counter>::default(),
            pending_appends: Family::<Vec<(String, String)>, Gauge>::default(),
            low_watermark: Family::<Vec<(String, String)>, Gauge>::default(),
            processing_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(
                || Histogram::new(exponential_buckets_range(100.0, 60_000_000.0 * 5.0, 10)),
            ),
            checkpoint: CheckpointMetrics {
                commit_total: Family::<Vec<(String, String)>, Counter>::default(),
                failure_total: Family::<Vec<(String, String)>, Counter>::default(),
            },
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            READ_TOTAL,
            "A Counter to keep track of the total number of records read from input streams",
            metrics.read_total.clone(),
        );
        registry.register(
            PROCESSED_TOTAL,
            "A Counter to keep track of the total number of records successfully processed",
            metrics.processed_total.clone(),
        );
        registry.register(
            PRODUCED_TOTAL,
            "A Counter to keep track of the total number of records appended to output streams",
            metrics.produced_total.clone(),
        );
        registry.register(
            FAILURE_TOTAL,
            "A Counter to keep track of the total number of failed processing attempts",
            metrics.failure_total.clone(),
        );
        registry.register(
            RETRY_TOTAL,
            "A Counter to keep track of the total number of processing retries",
            metrics.retry_total.clone(),
        );
        registry.register(
            DEAD_LETTER_TOTAL,
            "A Counter to keep track of the total number of records sent to a dead-letter stream",
            metrics.dead_letter_total.clone(),
        );
        registry.register(
            BACKPRESSURE_TOTAL,
            "A Counter to keep track of the number of times polling paused on pending appends",
            metrics.backpressure_total.clone(),
        );
        registry.register(
            PENDING_APPENDS,
            "A Gauge to keep track of the produced records not yet acknowledged by the log",
            metrics.pending_appends.clone(),
        );
        registry.register(
            LOW_WATERMARK,
            "A Gauge to keep track of the low watermark timestamp of each task, in milliseconds",
            metrics.low_watermark.clone(),
        );
        registry.register(
            PROCESSING_TIME,
            "A Histogram to keep track of the time taken to process a record, in microseconds",
            metrics.processing_time.clone(),
        );

        let checkpoint_registry = registry.sub_registry_with_prefix(CHECKPOINT_REGISTRY_PREFIX);
        checkpoint_registry.register(
            CHECKPOINT_TOTAL,
            "A Counter to keep track of the total number of committed checkpoints",
            metrics.checkpoint.commit_total.clone(),
        );
        checkpoint_registry.register(
            CHECKPOINT_FAILURE_TOTAL,
            "A Counter to keep track of the checkpoints that could not be committed",
            metrics.checkpoint.failure_total.clone(),
        );
        metrics
    }
}

static RUNNER_METRICS: OnceLock<RunnerMetrics> = OnceLock::new();

pub(crate) fn runner_metrics() -> &'static RunnerMetrics {
    RUNNER_METRICS.get_or_init(RunnerMetrics::new)
}

pub(crate) fn task_labels(computation: &str, partition: u16) -> Vec<(String, String)> {
    vec![
        (COMPUTATION_LABEL.to_string(), computation.to_string()),
        (PARTITION_LABEL.to_string(), partition.to_string()),
    ]
}

pub(crate) fn stream_labels(computation: &str, stream: &str) -> Vec<(String, String)> {
    vec![
        (COMPUTATION_LABEL.to_string(), computation.to_string()),
        (STREAM_LABEL.to_string(), stream.to_string()),
    ]
}

/// Snapshot of every registered metric in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the families exist even before the first task starts
    runner_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_span_range() {
        let buckets: Vec<f64> = exponential_buckets_range(1.0, 1000.0, 4).collect();
        assert_eq!(buckets.len(), 4);
        assert!((buckets[0] - 1.0).abs() < 1e-9);
        assert!((buckets[3] - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn encodes_registered_families() {
        runner_metrics()
            .read_total
            .get_or_create(&task_labels("metrics-test", 0))
            .inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("logflow_read_total"));
        assert!(text.contains("computation=\"metrics-test\""));
        assert!(text.contains("logflow_checkpoint_commit_total"));
    }
}
