use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Counter Error - {0}")]
    Counter(String),

    #[error("Overflow Error - {0}")]
    Overflow(String),

    #[error("Store Error - {0}")]
    Store(String),
}
