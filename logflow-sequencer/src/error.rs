use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Sequence {key} cannot be initialized to {value}, its current value is {current}")]
    Init {
        key: String,
        value: i64,
        current: i64,
    },

    #[error("Sequence {key} exceeded the range of {range} with {value}")]
    Overflow {
        key: String,
        value: i64,
        range: &'static str,
    },

    #[error("Invalid block size {size} for sequence {key}")]
    BlockSize { key: String, size: usize },

    #[error("Store Error - {0}")]
    Store(String),
}
