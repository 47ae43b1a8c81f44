//! A [Computation] is user code reading records from its input streams and producing records to
//! its output streams. Each instance is driven by exactly one task and never shared, so it can
//! keep plain mutable state.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{LogRecord, Record};

mod batch;
mod context;

pub use batch::{BatchComputation, Batched};
pub use context::ComputationContext;

/// Names of a computation and of the streams it reads and writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputationMetadata {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl ComputationMetadata {
    pub fn new<I, O>(name: impl Into<String>, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }

    /// Metadata with generic stream names `i1..iN` and `o1..oM`, meant to be bound to real
    /// streams when the computation is added to a topology.
    pub fn with_arity(name: impl Into<String>, inputs: usize, outputs: usize) -> Self {
        Self::new(
            name,
            (1..=inputs).map(|i| format!("i{i}")),
            (1..=outputs).map(|o| format!("o{o}")),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Same computation with every stream renamed through `mapping`.
    pub(crate) fn mapped(&self, mapping: &StreamMapping) -> Self {
        Self {
            name: self.name.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|s| mapping.physical(s).to_string())
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|s| mapping.physical(s).to_string())
                .collect(),
        }
    }
}

impl fmt::Display for ComputationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({} -> {})",
            self.name,
            self.inputs.join(","),
            self.outputs.join(",")
        )
    }
}

/// Why a stream mapping entry was refused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, thiserror::Error)]
pub enum MappingError {
    #[error("invalid stream mapping {0:?}, expected logical:physical")]
    Malformed(String),

    #[error("invalid stream mapping {0:?}, empty name")]
    EmptyName(String),

    #[error("stream {0:?} is mapped twice")]
    MappedTwice(String),
}

/// Binds the stream names a computation uses in its code to the streams of the topology, from
/// `"logical:physical"` entries such as `"i1:input"`. Unmapped names are used as they are.
#[derive(Clone, Debug, Default)]
pub struct StreamMapping {
    to_physical: HashMap<String, String>,
    to_logical: HashMap<String, String>,
}

impl StreamMapping {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> std::result::Result<Self, MappingError> {
        let mut mapping = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let Some((logical, physical)) = entry.split_once(':') else {
                return Err(MappingError::Malformed(entry.to_string()));
            };
            let (logical, physical) = (logical.trim(), physical.trim());
            if logical.is_empty() || physical.is_empty() {
                return Err(MappingError::EmptyName(entry.to_string()));
            }
            if mapping
                .to_physical
                .insert(logical.to_string(), physical.to_string())
                .is_some()
            {
                return Err(MappingError::MappedTwice(logical.to_string()));
            }
            mapping
                .to_logical
                .insert(physical.to_string(), logical.to_string());
        }
        Ok(mapping)
    }

    pub fn physical<'a>(&'a self, logical: &'a str) -> &'a str {
        self.to_physical.get(logical).map_or(logical, String::as_str)
    }

    pub fn logical<'a>(&'a self, physical: &'a str) -> &'a str {
        self.to_logical.get(physical).map_or(physical, String::as_str)
    }
}

/// User logic plugged into the engine. All callbacks of one instance are invoked sequentially by
/// the task owning it.
///
/// Processing is at-least-once: whatever was processed after the last checkpoint is delivered
/// again after a restart, and a failed invocation is replayed when the policy retries it.
/// Records produced by a failed invocation are discarded before the replay.
#[async_trait]
pub trait Computation: Send {
    fn metadata(&self) -> ComputationMetadata;

    async fn init(&mut self, _ctx: &mut ComputationContext) -> Result<()> {
        Ok(())
    }

    /// `input_stream` is the name the computation declared in its metadata. The record carries
    /// the partition and offset it was read from.
    async fn process_record(
        &mut self,
        ctx: &mut ComputationContext,
        input_stream: &str,
        record: &LogRecord,
    ) -> Result<()>;

    async fn process_timer(
        &mut self,
        _ctx: &mut ComputationContext,
        _key: &str,
        _timestamp: i64,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a failure is skipped. Returns the records buffered by the computation that
    /// will never be processed, so they can be dead-lettered along with the failing one.
    fn discard_pending(&mut self) -> Vec<Record> {
        Vec::new()
    }

    async fn destroy(&mut self) {}
}
