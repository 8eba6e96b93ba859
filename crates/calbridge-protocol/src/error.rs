//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed in the middle of a frame.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    #[error("empty message")]
    EmptyMessage,

    /// Event name outside the broadcast vocabulary.
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl ProtocolError {
    /// Errors after which the byte stream can no longer be trusted.
    ///
    /// A frame that decoded to bad JSON is skipped; a broken length prefix
    /// or transport error ends the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Serialization(_) | Self::UnsupportedVersion(_) | Self::UnknownEvent(_)
        )
    }
}
