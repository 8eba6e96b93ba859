//! Provider error types.
//!
//! Every failure a provider reports falls into one [`ProviderErrorCode`].
//! The code decides how the worker reacts: [`Offline`] errors queue the
//! account for a retry once connectivity returns, everything else is
//! surfaced to the UI with a localizable [`message_key`].
//!
//! [`Offline`]: ProviderErrorCode::Offline
//! [`message_key`]: ProviderError::message_key

use std::fmt;

use calbridge_store::StoreError;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorCode {
    /// Credentials rejected (401/403).
    Authentication,
    /// The endpoint is not a usable calendar server.
    InvalidServer,
    /// The server answered with a failure (5xx, 429).
    ServerFailure,
    /// No response could be obtained.
    Offline,
    /// The calendar's capabilities do not allow the operation.
    PermissionDenied,
    NotFound,
    Internal,
}

impl ProviderErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::InvalidServer => "invalid_server",
            Self::ServerFailure => "server_failure",
            Self::Offline => "offline",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }

    /// Localization key shown to the user.
    pub fn message_key(&self) -> &'static str {
        match self {
            Self::Authentication => "error-unauthenticated",
            Self::InvalidServer => "error-invalid-server",
            Self::ServerFailure => "error-internal-server-error",
            Self::Offline => "error-offline",
            Self::PermissionDenied => "error-permission-denied",
            Self::NotFound => "error-not-found",
            Self::Internal => "error-internal",
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub struct ProviderError {
    code: ProviderErrorCode,
    message: String,
    /// Structured context forwarded to the UI (status codes, hrefs).
    detail: Value,
    provider: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: Value::Null,
            provider: None,
            source: None,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Authentication, message)
    }

    pub fn invalid_server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidServer, message)
    }

    pub fn server_failure(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ServerFailure, message)
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Offline, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::Internal, message)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ProviderErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> &Value {
        &self.detail
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn message_key(&self) -> &'static str {
        self.code.message_key()
    }

    /// Whether this failure should be retried on reconnection.
    pub fn is_offline(&self) -> bool {
        self.code == ProviderErrorCode::Offline
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref provider) = self.provider {
            write!(f, "[{}] ", provider)?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<StoreError> for ProviderError {
    fn from(error: StoreError) -> Self {
        Self::internal(format!("store failure: {}", error)).with_source(error)
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
