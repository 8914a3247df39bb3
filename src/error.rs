use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A primitive failed inside the engine; carries the engine's error text
    /// verbatim. The text varies by engine build, match on the variant.
    #[error("engine operation failed: {0}")]
    Engine(String),

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("maximum image size exceeded")]
    SizeExceeded,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    pub(crate) fn engine(err: impl std::fmt::Display) -> Self {
        Error::Engine(err.to_string())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
