//! Backoff strategies. Both are plain iterators of sleep durations.

pub mod exponential;
pub mod fixed;
