//! Server error types.

use std::io;

use calbridge_protocol::{ErrorCode, ErrorResponse};
use calbridge_providers::{ProviderError, ProviderErrorCode};
use calbridge_store::StoreError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] calbridge_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("socket path already in use: {path}")]
    SocketInUse { path: String },

    #[error("socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// The worker thread or its runtime could not be started.
    #[error("worker failed to start: {message}")]
    WorkerStart { message: String },
}

impl ServerError {
    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }

    pub fn worker_start(message: impl Into<String>) -> Self {
        Self::WorkerStart {
            message: message.into(),
        }
    }
}

/// Wire code for a provider failure.
pub fn error_code(code: ProviderErrorCode) -> ErrorCode {
    match code {
        ProviderErrorCode::Authentication => ErrorCode::Authentication,
        ProviderErrorCode::InvalidServer => ErrorCode::InvalidServer,
        ProviderErrorCode::ServerFailure => ErrorCode::ServerFailure,
        ProviderErrorCode::Offline => ErrorCode::Offline,
        ProviderErrorCode::PermissionDenied => ErrorCode::PermissionDenied,
        ProviderErrorCode::NotFound => ErrorCode::NotFound,
        ProviderErrorCode::Internal => ErrorCode::InternalError,
    }
}

/// Rejection reason for a failed provider call. `detail` carries the
/// localizable message key and the provider tag.
pub fn provider_rejection(error: ProviderError) -> ErrorResponse {
    let mut detail = error.detail().clone();
    if detail.is_null() {
        detail = serde_json::json!({});
    }
    if let Some(object) = detail.as_object_mut() {
        object.insert("message_key".to_string(), error.message_key().into());
        if let Some(provider) = error.provider() {
            object.insert("provider".to_string(), provider.into());
        }
    }
    ErrorResponse::new(error_code(error.code()), error.message()).with_detail(detail)
}

pub fn store_rejection(error: StoreError) -> ErrorResponse {
    match error {
        StoreError::UnknownKind(kind) => ErrorResponse::invalid_request(kind.to_string()),
        other => ErrorResponse::internal(other.to_string()),
    }
}

impl From<ServerError> for ErrorResponse {
    fn from(error: ServerError) -> Self {
        match error {
            ServerError::Provider(e) => provider_rejection(e),
            ServerError::Store(e) => store_rejection(e),
            other => ErrorResponse::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_class_on_the_wire() {
        let response =
            provider_rejection(ProviderError::offline("no route to host").with_provider("caldav"));
        assert_eq!(response.code, ErrorCode::Offline);
        insta::assert_json_snapshot!(response, @r#"
        {
          "code": "offline",
          "message": "no route to host",
          "detail": {
            "message_key": "error-offline",
            "provider": "caldav"
          }
        }
        "#);
    }

    #[test]
    fn unknown_kind_is_an_invalid_request() {
        let error = StoreError::UnknownKind(calbridge_core::UnknownKind("Bogus".to_string()));
        let response = store_rejection(error);
        assert_eq!(response.code, ErrorCode::InvalidRequest);
    }
}
