use thiserror::Error;

/// Errors raised by a [crate::log::Log] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("unknown stream {0}")]
    UnknownStream(String),

    #[error("stream {stream} has no partition {partition}")]
    UnknownPartition { stream: String, partition: u16 },

    #[error("stream {0} already exists with {1} partitions")]
    PartitionMismatch(String, u16),

    #[error("append failed - {0}")]
    Append(String),

    #[error("read failed - {0}")]
    Read(String),

    #[error("commit failed - {0}")]
    Commit(String),

    #[error("codec failure - {0}")]
    Codec(String),

    #[error("stream {stream} holds records encoded with {current}, cannot switch to {requested}")]
    CodecMismatch {
        stream: String,
        current: String,
        requested: String,
    },
}
