//! CalDAV client configuration.

use std::time::Duration;

use calbridge_core::Account;
use url::Url;

use crate::error::{ProviderError, ProviderResult};

#[derive(Debug, Clone)]
pub struct CalDavConfig {
    /// Calendar home (or principal) URL; calendars are discovered below it.
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_tls: bool,
    pub timeout: Duration,
    pub user_agent: String,
}

impl CalDavConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

    pub fn new(url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        let parsed = Url::parse(url.as_ref())?;
        Ok(Self {
            url: parsed,
            username: None,
            password: None,
            verify_tls: true,
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            user_agent: format!("calbridge/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Configuration for a CalDAV account record.
    pub fn from_account(account: &Account) -> ProviderResult<Self> {
        let url = account.url.as_deref().ok_or_else(|| {
            ProviderError::invalid_server(format!("account '{}' has no server URL", account.id))
        })?;
        let mut config = Self::new(url).map_err(|e| {
            ProviderError::invalid_server(format!("invalid server URL '{}': {}", url, e))
                .with_source(e)
        })?;
        if let Some(ref credentials) = account.credentials {
            config = config.with_credentials(&credentials.username, &credentials.password);
        }
        Ok(config)
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Disables TLS verification (for testing only).
    pub fn with_insecure_tls(mut self) -> Self {
        self.verify_tls = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calbridge_core::Credentials;

    #[test]
    fn from_account_carries_credentials() {
        let account = Account::caldav("work", "https://dav.example.com/calendars/alice/")
            .with_credentials(Credentials::new("alice", "secret"));
        let config = CalDavConfig::from_account(&account).unwrap();
        assert_eq!(config.url.as_str(), "https://dav.example.com/calendars/alice/");
        assert!(config.has_credentials());
        assert!(config.verify_tls);
    }

    #[test]
    fn missing_or_bad_url_is_invalid_server() {
        let mut account = Account::caldav("work", "not a url");
        let err = CalDavConfig::from_account(&account).unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::InvalidServer);

        account.url = None;
        let err = CalDavConfig::from_account(&account).unwrap_err();
        assert!(err.message().contains("no server URL"));
    }

    #[test]
    fn builder_methods() {
        let config = CalDavConfig::new("https://dav.example.com/")
            .unwrap()
            .with_insecure_tls()
            .with_timeout(Duration::from_secs(5));
        assert!(!config.verify_tls);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!config.has_credentials());
    }
}
