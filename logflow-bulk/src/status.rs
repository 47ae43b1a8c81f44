use std::fmt;

use chrono::{DateTime, Utc};
use logflow_core::{Value, ValueMap};
use serde::{Deserialize, Serialize};

use crate::merge::merge_maps;

/// Lifecycle of a bulk command. The order is the merge order, a merged status is in the most
/// advanced state of its parts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkState {
    #[default]
    Scheduled,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for BulkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BulkState::Scheduled => "SCHEDULED",
            BulkState::Running => "RUNNING",
            BulkState::Completed => "COMPLETED",
            BulkState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Progress of a bulk command, either the aggregated view or a delta reported by a worker.
/// A delta only sets what it changes, `BulkStatus::delta(id).processed(10)` adds ten processed
/// documents when merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatus {
    pub command_id: String,
    pub state: BulkState,
    pub processed: u64,
    pub total: u64,
    pub errors: u64,
    #[serde(default)]
    pub result: ValueMap,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkStatus {
    pub fn scheduled(command_id: impl Into<String>, submitted_at: DateTime<Utc>) -> Self {
        Self {
            command_id: command_id.into(),
            submitted_at: Some(submitted_at),
            ..Self::default()
        }
    }

    /// Neutral status, merging it changes nothing.
    pub fn delta(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            ..Self::default()
        }
    }

    pub fn running(mut self, started_at: DateTime<Utc>) -> Self {
        self.state = BulkState::Running;
        self.started_at = Some(started_at);
        self
    }

    pub fn aborted(mut self, at: DateTime<Utc>) -> Self {
        self.state = BulkState::Aborted;
        self.completed_at = Some(at);
        self
    }

    pub fn processed(mut self, processed: u64) -> Self {
        self.processed = processed;
        self
    }

    pub fn total(mut self, total: u64) -> Self {
        self.total = total;
        self
    }

    pub fn errors(mut self, errors: u64) -> Self {
        self.errors = errors;
        self
    }

    pub fn result(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.insert(key.into(), value.into());
        self
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, BulkState::Completed | BulkState::Aborted)
    }

    /// Combines two views of the same command. Counts and results add up, the total and the
    /// state keep their maximum, start times their minimum and completion times their maximum.
    /// Counts saturate at `u64::MAX`, which keeps the merge associative.
    pub fn merge(&self, other: &BulkStatus) -> BulkStatus {
        BulkStatus {
            command_id: self.command_id.clone().max(other.command_id.clone()),
            state: self.state.max(other.state),
            processed: self.processed.saturating_add(other.processed),
            total: self.total.max(other.total),
            errors: self.errors.saturating_add(other.errors),
            result: merge_maps(&self.result, &other.result),
            submitted_at: earliest(self.submitted_at, other.submitted_at),
            started_at: earliest(self.started_at, other.started_at),
            completed_at: self.completed_at.max(other.completed_at),
        }
    }

    /// Running becomes completed once every document was processed.
    pub(crate) fn promote(mut self, now: DateTime<Utc>) -> Self {
        if self.state == BulkState::Running && self.total > 0 && self.processed >= self.total {
            self.state = BulkState::Completed;
            self.completed_at = Some(self.completed_at.unwrap_or(now));
        }
        self
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl fmt::Display for BulkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{} errors={}",
            self.command_id, self.state, self.processed, self.total, self.errors
        )
    }
}
