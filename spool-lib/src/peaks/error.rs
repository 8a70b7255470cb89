use thiserror::Error;

/// Error type for peak building and binary peak-file IO.
#[derive(Debug, Error)]
pub enum PeaksError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid peaks format: {0}")]
    InvalidFormat(String),
    #[error("invalid chunk size {0}")]
    InvalidChunksize(u32),
}

impl From<crate::error::EngineError> for PeaksError {
    fn from(value: crate::error::EngineError) -> Self {
        match value {
            crate::error::EngineError::Io(err) => Self::Io(err),
            other => Self::Decode(other.to_string()),
        }
    }
}
