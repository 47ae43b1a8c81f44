use thiserror::Error;

use crate::log::LogError;
use crate::topology::TopologyError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Topology Error - {0}")]
    Topology(#[from] TopologyError),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("Log Error - {0}")]
    Log(#[from] LogError),

    #[error("Computation Error - {0}")]
    Computation(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Processor Error - {0}")]
    Processor(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task Join Error - {0}")]
    Join(String),
}

impl Error {
    /// Codec failures are deterministic, replaying the same bytes fails the same way.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Codec(_) | Error::Cancelled)
    }

    /// Errors that only stop the task that hit them, instead of halting the whole topology.
    pub(crate) fn is_task_local(&self) -> bool {
        matches!(self, Error::Checkpoint(_) | Error::Log(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Join(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(err: prost::EncodeError) -> Self {
        Error::Codec(err.to_string())
    }
}
