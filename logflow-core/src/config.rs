use std::collections::HashMap;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};

pub mod policy;

pub use policy::{BatchPolicy, ComputationPolicy, RetryPolicy};

/// Base64 encoded JSON [Settings].
pub const ENV_SETTINGS: &str = "LOGFLOW_SETTINGS";

const DEFAULT_MAX_RECORDS: usize = 100;
const DEFAULT_MAX_WAIT_MILLIS: u64 = 100;
const DEFAULT_MAX_RECORDS_SINCE_CHECKPOINT: usize = 100;
const DEFAULT_MAX_MILLIS_SINCE_CHECKPOINT: u64 = 1_000;
const DEFAULT_MAX_PENDING_APPENDS: usize = 500;
const DEFAULT_PARTITIONS: u16 = 1;
const DEFAULT_CHECKPOINT_RETRIES: usize = 5;
const DEFAULT_CHECKPOINT_RETRY_DELAY_MILLIS: u64 = 50;
const DEFAULT_CHECKPOINT_TIMEOUT_MILLIS: u64 = 5_000;

/// Process wide settings, loaded once from [ENV_SETTINGS] (defaults when unset).
pub fn config() -> Result<&'static Settings> {
    static CONF: OnceLock<Settings> = OnceLock::new();
    if let Some(settings) = CONF.get() {
        return Ok(settings);
    }
    let settings = Settings::load()?;
    Ok(CONF.get_or_init(|| settings))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Records fetched per poll, across all input partitions of a task.
    pub max_records: usize,
    /// How long a poll waits for input before the task looks at its timers again.
    pub max_wait_ms: u64,
    pub max_records_since_checkpoint: usize,
    pub max_ms_since_checkpoint: u64,
    /// Produced records not yet acknowledged by the log before the task stops polling.
    pub max_pending_appends: usize,
    /// Partitions of the streams created by the engine itself, i.e. undeclared dead-letter
    /// streams.
    pub default_partitions: u16,
    /// Name of the record codec used by the log.
    pub codec: String,
    /// Per stream overrides of `codec`.
    pub codecs: HashMap<String, String>,
    pub checkpoint: CheckpointSettings,
    pub default_policy: ComputationPolicy,
    /// Per computation overrides of `default_policy`.
    pub policies: HashMap<String, ComputationPolicy>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_wait_ms: DEFAULT_MAX_WAIT_MILLIS,
            max_records_since_checkpoint: DEFAULT_MAX_RECORDS_SINCE_CHECKPOINT,
            max_ms_since_checkpoint: DEFAULT_MAX_MILLIS_SINCE_CHECKPOINT,
            max_pending_appends: DEFAULT_MAX_PENDING_APPENDS,
            default_partitions: DEFAULT_PARTITIONS,
            codec: codec::PROTO.to_string(),
            codecs: HashMap::new(),
            checkpoint: CheckpointSettings::default(),
            default_policy: ComputationPolicy::default(),
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckpointSettings {
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    /// Per attempt timeout of a commit.
    pub timeout_ms: u64,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_CHECKPOINT_RETRIES,
            retry_delay_ms: DEFAULT_CHECKPOINT_RETRY_DELAY_MILLIS,
            timeout_ms: DEFAULT_CHECKPOINT_TIMEOUT_MILLIS,
        }
    }
}

impl CheckpointSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        match env::var(ENV_SETTINGS) {
            Ok(encoded) => Self::from_base64(&encoded),
            Err(env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(Error::Config(format!("{ENV_SETTINGS}: {e}"))),
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::Config(format!("settings are not base64: {e}")))?;
        let settings: Settings = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(Error::Config("maxRecords must be positive".to_string()));
        }
        if self.max_pending_appends == 0 {
            return Err(Error::Config("maxPendingAppends must be positive".to_string()));
        }
        if self.default_partitions == 0 {
            return Err(Error::Config("defaultPartitions must be positive".to_string()));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn max_duration_since_checkpoint(&self) -> Duration {
        Duration::from_millis(self.max_ms_since_checkpoint)
    }

    pub fn policy(&self, computation: &str) -> &ComputationPolicy {
        self.policies
            .get(computation)
            .unwrap_or(&self.default_policy)
    }

    pub fn codec_for(&self, stream: &str) -> &str {
        self.codecs.get(stream).unwrap_or(&self.codec)
    }

    pub fn with_codec(mut self, stream: impl Into<String>, codec: impl Into<String>) -> Self {
        self.codecs.insert(stream.into(), codec.into());
        self
    }

    pub fn with_policy(mut self, computation: impl Into<String>, policy: ComputationPolicy) -> Self {
        self.policies.insert(computation.into(), policy);
        self
    }

    pub fn with_default_policy(mut self, policy: ComputationPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = max_wait.as_millis() as u64;
        self
    }

    pub fn with_checkpoint_thresholds(mut self, records: usize, duration: Duration) -> Self {
        self.max_records_since_checkpoint = records;
        self.max_ms_since_checkpoint = duration.as_millis() as u64;
        self
    }

    pub fn with_max_pending_appends(mut self, max_pending_appends: usize) -> Self {
        self.max_pending_appends = max_pending_appends.max(1);
        self
    }

    pub fn with_partitions(mut self, partitions: u16) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointSettings) -> Self {
        self.checkpoint = checkpoint;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn encode(value: serde_json::Value) -> String {
        BASE64_STANDARD.encode(value.to_string())
    }

    #[test]
    fn defaults_when_fields_are_missing() {
        let settings = Settings::from_base64(&encode(json!({}))).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.codec, "proto");
    }

    #[test]
    fn per_computation_policies() {
        let settings = Settings::from_base64(&encode(json!({
            "maxRecords": 10,
            "maxWaitMs": 5,
            "checkpoint": {"maxRetries": 1},
            "policies": {
                "counter": {"continueOnFailure": true, "retry": {"maxRetries": 3}}
            }
        })))
        .unwrap();
        assert_eq!(settings.max_records, 10);
        assert_eq!(settings.max_wait(), Duration::from_millis(5));
        assert_eq!(settings.checkpoint.max_retries, 1);
        assert_eq!(
            settings.checkpoint.timeout_ms,
            DEFAULT_CHECKPOINT_TIMEOUT_MILLIS
        );
        assert!(settings.policy("counter").continue_on_failure);
        assert_eq!(settings.policy("counter").retry.max_retries, 3);
        assert!(!settings.policy("other").continue_on_failure);
    }

    #[test]
    fn per_stream_codecs() {
        let settings = Settings::from_base64(&encode(json!({
            "codec": "json",
            "codecs": {"clicks": "proto"}
        })))
        .unwrap();
        assert_eq!(settings.codec_for("clicks"), "proto");
        assert_eq!(settings.codec_for("views"), "json");

        let settings = Settings::default().with_codec("views", codec::JSON);
        assert_eq!(settings.codec_for("views"), "json");
        assert_eq!(settings.codec_for("clicks"), "proto");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Settings::from_base64("%%%"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::from_base64(&BASE64_STANDARD.encode("not json")),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::from_base64(&encode(json!({"maxRecords": 0}))),
            Err(Error::Config(_))
        ));
    }
}
