use thiserror::Error;

/// Errors produced by the tour terminal protocol and its endpoints.
#[derive(Debug, Error)]
pub enum TourError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TourError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            TourError::MalformedEnvelope(e.to_string())
        } else {
            TourError::Codec(e.to_string())
        }
    }
}

pub type TourResult<T> = Result<T, TourError>;
