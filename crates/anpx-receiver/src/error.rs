use thiserror::Error;

/// Errors produced by the receiver.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] anpx_core::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReceiverResult<T> = Result<T, ReceiverError>;
