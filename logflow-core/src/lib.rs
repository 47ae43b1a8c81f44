//! Partitioned, watermark ordered log computation engine.
//!
//! A [Topology] wires [Computation]s together through the streams of a [Log]. The
//! [StreamProcessor] runs one task per computation and input partition; each task polls its
//! input partitions, invokes the computation, appends what it produces and commits
//! [Checkpoint]s. Delivery is at-least-once: after a restart a task resumes from its last
//! checkpoint and whatever was processed after it is processed again.
//!
//! Progress is tracked with [Watermark]s. Every task forwards the lowest watermark over its
//! inputs and, once all of its inputs are complete, sends a completion marker downstream.

pub mod codec;
pub mod computation;
pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod processor;
pub mod record;
mod runner;
pub mod topology;
pub mod value;
pub mod watermark;

pub use crate::computation::{
    BatchComputation, Batched, Computation, ComputationContext, ComputationMetadata, MappingError,
};
pub use crate::config::{BatchPolicy, ComputationPolicy, RetryPolicy, Settings};
pub use crate::error::{Error, Result};
pub use crate::log::memory::MemoryLog;
pub use crate::log::{Checkpoint, Log, LogError, LogLag, LogPartition};
pub use crate::processor::StreamProcessor;
pub use crate::record::{LogRecord, Record};
pub use crate::runner::TaskStatus;
pub use crate::topology::{Topology, TopologyError, TopologyProblem};
pub use crate::value::{Value, ValueMap};
pub use crate::watermark::{MonotonicGenerator, Watermark};
