use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Validation Error - {0}")]
    Validation(String),

    #[error("Unknown Action - {0}")]
    UnknownAction(String),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("{0}")]
    Core(#[from] logflow_core::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

/// Bulk failures raised inside computations. Codec failures stay non-retryable.
impl From<Error> for logflow_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(err) => err,
            Error::Codec(msg) => logflow_core::Error::Codec(msg),
            other => logflow_core::Error::Computation(other.to_string()),
        }
    }
}
