//! Client error types.

use std::fmt;

use calbridge_protocol::{ErrorResponse, ProtocolError};
use thiserror::Error;

/// Failure of a bridge call, as seen from the UI end.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bridge was closed, or closed while the call was waiting.
    #[error("bridge transport closed")]
    TransportClosed,

    #[error("{service}.{method} timed out after {}ms", timeout.as_millis())]
    Timeout {
        service: String,
        method: String,
        timeout: std::time::Duration,
    },

    /// The worker never announced its services.
    #[error("worker did not become ready within {}ms", timeout.as_millis())]
    ServiceNotReady { timeout: std::time::Duration },

    /// The worker is ready but has no service by this name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The handler rejected the call.
    #[error("{0}")]
    Remote(ErrorResponse),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// The rejection sent by the worker, if that is what this is.
    pub fn remote(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Remote(response) => Some(response),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors of the CLI.
#[derive(Debug)]
pub enum ClientError {
    /// Configuration error.
    Config(String),
    /// Connection to the daemon failed.
    Connection(String),
    /// A bridge call failed.
    Bridge(BridgeError),
    /// The daemon could not be started.
    Server(calbridge_server::ServerError),
    /// The requested record does not exist.
    NotFound(String),
    /// IO error.
    Io(std::io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Bridge(err) => write!(f, "{}", err),
            Self::Server(err) => write!(f, "daemon error: {}", err),
            Self::NotFound(msg) => write!(f, "not found: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bridge(err) => Some(err),
            Self::Server(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<BridgeError> for ClientError {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

impl From<calbridge_server::ServerError> for ClientError {
    fn from(err: calbridge_server::ServerError) -> Self {
        Self::Server(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calbridge_protocol::ErrorCode;
    use std::time::Duration;

    #[test]
    fn messages() {
        let timeout = BridgeError::Timeout {
            service: "calendar".into(),
            method: "sync".into(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(timeout.to_string(), "calendar.sync timed out after 250ms");

        let remote = BridgeError::Remote(ErrorResponse::new(ErrorCode::NotFound, "no account 'x'"));
        assert_eq!(remote.remote().map(|r| r.code), Some(ErrorCode::NotFound));
        assert!(BridgeError::TransportClosed.remote().is_none());

        let err = ClientError::from(BridgeError::UnknownService("nope".into()));
        assert_eq!(err.to_string(), "unknown service: nope");
    }
}
