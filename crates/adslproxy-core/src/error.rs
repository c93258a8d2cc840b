use thiserror::Error;

/// Errors produced by the adslproxy protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("forward rejected: {0}")]
    Forward(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
