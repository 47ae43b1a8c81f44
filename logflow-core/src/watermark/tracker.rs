//! Tracks the watermark of every input partition a task reads. The low watermark of the task is
//! the minimum, over all of its input partitions, of the highest watermark seen on each one. A
//! partition stays at [Watermark::LOWEST] until something is read from it, so a task never
//! claims progress for data it has not seen.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::log::LogPartition;
use crate::watermark::Watermark;

#[derive(Debug, Default)]
struct PartitionProgress {
    max: Watermark,
    /// producer tasks expected to report completion, empty when the writers are unknown
    producers: BTreeSet<String>,
    completed_by: BTreeSet<String>,
    completed: bool,
}

impl PartitionProgress {
    fn is_completed(&self) -> bool {
        self.completed
            || (!self.producers.is_empty() && self.producers.is_subset(&self.completed_by))
    }
}

#[derive(Debug, Default)]
pub(crate) struct WatermarkTracker {
    partitions: BTreeMap<LogPartition, PartitionProgress>,
}

impl WatermarkTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers an input partition with the producer tasks writing to it.
    pub(crate) fn track(
        &mut self,
        partition: LogPartition,
        producers: impl IntoIterator<Item = String>,
    ) {
        self.partitions.insert(
            partition,
            PartitionProgress {
                producers: producers.into_iter().collect(),
                ..Default::default()
            },
        );
    }

    /// Seeds a partition from a checkpoint so the watermark does not regress after a restart. A
    /// checkpoint committed past the completion marker carries the completion bit, the marker
    /// itself is never read again.
    pub(crate) fn restore(&mut self, partition: &LogPartition, watermark: Watermark) {
        self.observe(partition, watermark.uncompleted());
        if watermark.is_completed()
            && let Some(progress) = self.partitions.get_mut(partition)
        {
            progress.completed = true;
        }
    }

    pub(crate) fn observe(&mut self, partition: &LogPartition, watermark: Watermark) {
        if let Some(progress) = self.partitions.get_mut(partition)
            && watermark > progress.max
        {
            progress.max = watermark;
        }
    }

    /// Handles a completion control record sent by `producer`.
    pub(crate) fn complete(
        &mut self,
        partition: &LogPartition,
        producer: &str,
        watermark: Watermark,
    ) {
        let Some(progress) = self.partitions.get_mut(partition) else {
            return;
        };
        if watermark.uncompleted() > progress.max {
            progress.max = watermark.uncompleted();
        }
        if progress.producers.is_empty() {
            // unknown writers, trust the first marker
            progress.completed = true;
        } else {
            progress.completed_by.insert(producer.to_string());
        }
        debug!(
            %partition,
            producer,
            completed = progress.is_completed(),
            "Completion marker received"
        );
    }

    pub(crate) fn max(&self, partition: &LogPartition) -> Watermark {
        self.partitions
            .get(partition)
            .map_or(Watermark::LOWEST, |progress| progress.max)
    }

    pub(crate) fn is_partition_completed(&self, partition: &LogPartition) -> bool {
        self.partitions
            .get(partition)
            .is_some_and(PartitionProgress::is_completed)
    }

    pub(crate) fn low_watermark(&self) -> Watermark {
        self.partitions
            .values()
            .map(|progress| progress.max.uncompleted())
            .min()
            .unwrap_or(Watermark::LOWEST)
    }

    /// True once every tracked partition has been completed by all its producers.
    pub(crate) fn is_completed(&self) -> bool {
        !self.partitions.is_empty()
            && self
                .partitions
                .values()
                .all(PartitionProgress::is_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(p: u16) -> LogPartition {
        LogPartition::new("in", p)
    }

    fn producers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn low_is_min_of_partition_maxima() {
        let mut tracker = WatermarkTracker::new();
        tracker.track(part(0), producers(&["up:0"]));
        tracker.track(part(1), producers(&["up:0"]));
        tracker.observe(&part(0), Watermark::of_timestamp(100));
        assert_eq!(tracker.low_watermark(), Watermark::LOWEST);

        tracker.observe(&part(1), Watermark::of_timestamp(50));
        assert_eq!(tracker.low_watermark(), Watermark::of_timestamp(50));

        // an older record does not move a partition backwards
        tracker.observe(&part(1), Watermark::of_timestamp(10));
        assert_eq!(tracker.low_watermark(), Watermark::of_timestamp(50));

        tracker.observe(&part(1), Watermark::of_timestamp(200));
        assert_eq!(tracker.low_watermark(), Watermark::of_timestamp(100));
    }

    #[test]
    fn completion_needs_every_producer() {
        let mut tracker = WatermarkTracker::new();
        tracker.track(part(0), producers(&["a:0", "a:1"]));
        tracker.complete(&part(0), "a:0", Watermark::of_timestamp(10).completed());
        assert!(!tracker.is_completed());
        tracker.complete(&part(0), "a:1", Watermark::of_timestamp(20).completed());
        assert!(tracker.is_completed());
        assert_eq!(tracker.low_watermark(), Watermark::of_timestamp(20));
    }

    #[test]
    fn unknown_producers_complete_on_first_marker() {
        let mut tracker = WatermarkTracker::new();
        tracker.track(part(0), Vec::new());
        assert!(!tracker.is_completed());
        tracker.complete(&part(0), "external", Watermark::of_timestamp(5).completed());
        assert!(tracker.is_completed());
    }

    #[test]
    fn restore_seeds_partition() {
        let mut tracker = WatermarkTracker::new();
        tracker.track(part(0), producers(&["a:0"]));
        tracker.restore(&part(0), Watermark::of_timestamp(42));
        assert_eq!(tracker.max(&part(0)), Watermark::of_timestamp(42));
        assert!(!tracker.is_completed());
    }

    #[test]
    fn restore_keeps_completion() {
        let mut tracker = WatermarkTracker::new();
        tracker.track(part(0), producers(&["a:0"]));
        tracker.track(part(1), producers(&["a:0"]));
        tracker.restore(&part(0), Watermark::of_timestamp(42).completed());
        assert_eq!(tracker.max(&part(0)), Watermark::of_timestamp(42));
        assert!(tracker.is_partition_completed(&part(0)));
        assert!(!tracker.is_completed());

        tracker.complete(&part(1), "a:0", Watermark::of_timestamp(50).completed());
        assert!(tracker.is_completed());
        assert_eq!(tracker.low_watermark(), Watermark::of_timestamp(42));
    }

    #[test]
    fn untracked_partitions_are_ignored() {
        let mut tracker = WatermarkTracker::new();
        tracker.observe(&part(9), Watermark::of_timestamp(5));
        assert_eq!(tracker.low_watermark(), Watermark::LOWEST);
        assert!(!tracker.is_completed());
    }
}
