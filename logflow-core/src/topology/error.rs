use std::fmt;

use crate::computation::MappingError;

/// One thing wrong with a topology definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, thiserror::Error)]
pub enum TopologyProblem {
    #[error("computation {computation} reads undeclared stream {stream}")]
    UndeclaredInput { computation: String, stream: String },

    #[error("computation {computation} writes undeclared stream {stream}")]
    UndeclaredOutput { computation: String, stream: String },

    #[error("cyclic edge {from} -[{stream}]-> {to}")]
    CyclicEdge {
        from: String,
        stream: String,
        to: String,
    },

    #[error("duplicate computation name {0}")]
    DuplicateComputation(String),

    #[error("computation {computation}: {reason}")]
    InvalidMapping {
        computation: String,
        reason: MappingError,
    },

    #[error("stream {0} declared with zero partitions")]
    EmptyStream(String),

    #[error("topology has no computation")]
    Empty,
}

/// Every problem found while validating a topology, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyError {
    problems: Vec<TopologyProblem>,
}

impl TopologyError {
    pub(crate) fn new(problems: Vec<TopologyProblem>) -> Self {
        Self { problems }
    }

    pub fn problems(&self) -> &[TopologyProblem] {
        &self.problems
    }
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid topology: ")?;
        for (i, problem) in self.problems.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{problem}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TopologyError {}
