//! Client configuration.
//!
//! Everything lives in `~/.config/calbridge/config.toml`:
//!
//! ```toml
//! [server]
//! socket_path = "/run/user/1000/calbridge.sock"
//! request_timeout = 30
//!
//! [storage]
//! data_dir = "/home/alice/.local/share/calbridge"
//!
//! [[accounts]]
//! id = "work"
//! provider = "caldav"
//! url = "https://dav.example.com/calendars/alice/"
//! username = "alice"
//! password = "env::CALBRIDGE_WORK_PASSWORD"
//! ```
//!
//! Passwords accept the references described in [`crate::secret`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use calbridge_core::{Account, Credentials, ProviderKind};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub debug: bool,
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub accounts: Vec<AccountSettings>,
}

/// Daemon socket and bridge timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub socket_path: Option<PathBuf>,
    /// Seconds; unset waits for as long as the worker takes.
    pub request_timeout: Option<u64>,
    /// Seconds to wait for the worker to announce its services.
    pub ready_timeout: u64,
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            request_timeout: None,
            ready_timeout: 4,
            max_connections: 32,
        }
    }
}

impl ServerSettings {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(calbridge_server::default_socket_path)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let mut config =
            BridgeConfig::default().with_ready_timeout(Duration::from_secs(self.ready_timeout));
        if let Some(seconds) = self.request_timeout {
            config = config.with_request_timeout(Duration::from_secs(seconds));
        }
        config
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Where the daemon keeps its database snapshot.
    pub data_dir: Option<PathBuf>,
}

impl StorageSettings {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(ClientConfig::default_data_dir)
    }
}

/// One `[[accounts]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub id: String,
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AccountSettings {
    /// Builds the account record, resolving the password reference.
    pub fn to_account(&self) -> Result<Account, String> {
        match self.provider {
            ProviderKind::Local => Ok(Account::local(&self.id)),
            ProviderKind::Caldav => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| format!("account '{}' needs a url", self.id))?;
                let mut account = Account::caldav(&self.id, url);
                match (&self.username, &self.password) {
                    (Some(username), Some(password)) => {
                        let password = crate::secret::resolve(password).map_err(|e| {
                            format!("account '{}': failed to resolve password: {}", self.id, e)
                        })?;
                        account = account.with_credentials(Credentials::new(username, password));
                    }
                    (None, None) => {}
                    _ => {
                        return Err(format!(
                            "account '{}' needs both username and password, or neither",
                            self.id
                        ));
                    }
                }
                Ok(account)
            }
        }
    }
}

impl ClientConfig {
    /// Loads the default file; a missing file yields the defaults.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Checks every account without contacting any server.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(format!("duplicate account id '{}'", account.id));
            }
            account.to_account()?;
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calbridge")
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("calbridge")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.server.ready_timeout, 4);
        let bridge = config.server.bridge_config();
        assert_eq!(bridge.request_timeout, None);
        assert_eq!(bridge.ready_timeout, Duration::from_secs(4));
    }

    #[test]
    fn full_file() {
        let config: ClientConfig = toml::from_str(
            r#"
[server]
socket_path = "/tmp/cb.sock"
request_timeout = 10

[storage]
data_dir = "/tmp/cb-data"

[[accounts]]
id = "device"
provider = "local"

[[accounts]]
id = "work"
provider = "caldav"
url = "https://dav.example.com/"
username = "alice"
password = "secret"
"#,
        )
        .unwrap();
        assert_eq!(config.server.socket_path(), PathBuf::from("/tmp/cb.sock"));
        assert_eq!(
            config.server.bridge_config().request_timeout,
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.storage.data_dir(), PathBuf::from("/tmp/cb-data"));
        config.validate().unwrap();

        let work = config.accounts[1].to_account().unwrap();
        assert_eq!(work.provider, ProviderKind::Caldav);
        assert_eq!(work.credentials, Some(Credentials::new("alice", "secret")));
        assert_eq!(config.accounts[0].to_account().unwrap(), Account::local("device"));
    }

    #[test]
    fn password_from_environment() {
        unsafe {
            std::env::set_var("_CALBRIDGE_CONFIG_TEST_PW", "from-env");
        }
        let settings = AccountSettings {
            id: "work".into(),
            provider: ProviderKind::Caldav,
            url: Some("https://dav.example.com/".into()),
            username: Some("alice".into()),
            password: Some("env::_CALBRIDGE_CONFIG_TEST_PW".into()),
        };
        let account = settings.to_account().unwrap();
        assert_eq!(account.credentials.unwrap().password, "from-env");
        unsafe {
            std::env::remove_var("_CALBRIDGE_CONFIG_TEST_PW");
        }
    }

    #[test]
    fn invalid_accounts() {
        let mut settings = AccountSettings {
            id: "work".into(),
            provider: ProviderKind::Caldav,
            url: None,
            username: None,
            password: None,
        };
        assert!(settings.to_account().unwrap_err().contains("needs a url"));

        settings.url = Some("https://dav.example.com/".into());
        settings.username = Some("alice".into());
        assert!(settings.to_account().unwrap_err().contains("both username and password"));

        let device = AccountSettings {
            id: "device".into(),
            provider: ProviderKind::Local,
            url: None,
            username: None,
            password: None,
        };
        let config = ClientConfig {
            accounts: vec![device.clone(), device],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn default_paths() {
        assert!(ClientConfig::default_path().ends_with("calbridge/config.toml"));
        assert!(ClientConfig::default_data_dir().ends_with("calbridge"));
    }
}
