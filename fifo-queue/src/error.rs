//! Error types for the queue protocol

use thiserror::Error;

/// Queue error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed frame received from the peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request was sent but the connection closed before the response
    #[error("Connection closed while awaiting response to {0}")]
    ResponseDropped(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
