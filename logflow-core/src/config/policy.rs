use std::time::Duration;

use backoff::strategy::exponential::Exponential;
use serde::{Deserialize, Serialize};

const DEFAULT_RETRY_DELAY_MILLIS: u64 = 100;
const DEFAULT_RETRY_MAX_DELAY_MILLIS: u64 = 10_000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_BATCH_CAPACITY: usize = 10;
const DEFAULT_BATCH_THRESHOLD_MILLIS: u64 = 1_000;

/// What a computation task does when processing a record fails.
///
/// The default neither retries nor skips: the first failure halts the topology, leaving the
/// record unacknowledged for the next run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComputationPolicy {
    pub retry: RetryPolicy,
    /// Once retries are exhausted, move the record to the dead-letter stream and go on.
    pub continue_on_failure: bool,
    /// Defaults to `<computation>-dlq`.
    pub dead_letter_stream: Option<String>,
    pub batch: BatchPolicy,
}

impl ComputationPolicy {
    pub fn fail_fast() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn continue_on_failure(mut self, skip: bool) -> Self {
        self.continue_on_failure = skip;
        self
    }

    pub fn with_dead_letter_stream(mut self, stream: impl Into<String>) -> Self {
        self.dead_letter_stream = Some(stream.into());
        self
    }

    pub fn with_batch(mut self, batch: BatchPolicy) -> Self {
        self.batch = batch;
        self
    }

    pub fn dead_letter_stream_for(&self, computation: &str) -> String {
        self.dead_letter_stream
            .clone()
            .unwrap_or_else(|| format!("{computation}-dlq"))
    }
}

/// Bounded exponential retry, `max_retries` does not count the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: DEFAULT_RETRY_DELAY_MILLIS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MILLIS,
            factor: DEFAULT_RETRY_FACTOR,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            delay_ms: delay.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Fresh delay sequence for one record.
    pub fn backoff(&self) -> Exponential {
        Exponential::from_millis(self.delay_ms)
            .factor(self.factor)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .max_retries(self.max_retries)
    }
}

/// Records are buffered until `capacity` is reached or `threshold_ms` elapsed since the first
/// buffered record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchPolicy {
    pub capacity: usize,
    pub threshold_ms: u64,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BATCH_CAPACITY,
            threshold_ms: DEFAULT_BATCH_THRESHOLD_MILLIS,
        }
    }
}

impl BatchPolicy {
    pub fn new(capacity: usize, threshold: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            threshold_ms: threshold.as_millis() as u64,
        }
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_fail_fast_without_retry() {
        let policy = ComputationPolicy::default();
        assert!(!policy.continue_on_failure);
        assert_eq!(policy.retry.max_attempts(), 1);
        assert_eq!(policy.retry.backoff().count(), 0);
        assert_eq!(policy.dead_letter_stream_for("counter"), "counter-dlq");
    }

    #[test]
    fn retry_backoff_is_bounded() {
        let retry = RetryPolicy::new(3, Duration::from_millis(10));
        let delays: Vec<_> = retry.backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[test]
    fn deserializes_partial_json() {
        let policy: ComputationPolicy = serde_json::from_str(
            r#"{"retry": {"maxRetries": 2}, "continueOnFailure": true, "deadLetterStream": "errors"}"#,
        )
        .unwrap();
        assert_eq!(policy.retry.max_retries, 2);
        assert_eq!(policy.retry.delay_ms, DEFAULT_RETRY_DELAY_MILLIS);
        assert_eq!(policy.dead_letter_stream_for("x"), "errors");
        assert_eq!(policy.batch, BatchPolicy::default());
    }
}
