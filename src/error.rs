use thiserror::Error;
use tonic::Status;
use url::ParseError;

#[derive(Debug, Error)]
pub enum HoldfastError {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    Status(#[from] Status),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] ParseError),

    #[error("Stream unexpectedly ended")]
    StreamEnded,

    #[error("Hold stream timed out: {0}")]
    HoldTimeout(String),

    #[error("Sync stream out of sequence: expected {expected}, got {got}")]
    OutOfSync { expected: u64, got: u64 },

    #[error("Sync protocol violation: {0}")]
    Protocol(String),

    #[error("Request channel send error: {0}")]
    SendError(#[from] futures_channel::mpsc::SendError),

    #[error("Not currently held")]
    NotHeld,

    #[error("Already held")]
    AlreadyHeld,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}
