//! Accounts waiting for connectivity.
//!
//! A sync that fails with an offline error parks its account here. The set
//! lives in the `offlineRetry` setting, so it survives worker restarts.

use std::collections::BTreeSet;
use std::sync::Weak;

use calbridge_providers::NetworkState;
use calbridge_store::settings::keys;
use calbridge_store::{Settings, StoreResult, StoreSettings};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::calendar_service::CalendarService;

#[derive(Debug)]
pub struct OfflineRetry {
    settings: StoreSettings,
    accounts: Mutex<BTreeSet<String>>,
}

impl OfflineRetry {
    /// Loads the persisted set. An unreadable value counts as empty.
    pub async fn load(settings: StoreSettings) -> StoreResult<Self> {
        let accounts = match settings.get_setting(keys::OFFLINE_RETRY).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "ignoring malformed offline retry set");
                BTreeSet::new()
            }),
            None => BTreeSet::new(),
        };
        if !accounts.is_empty() {
            info!(?accounts, "offline retries restored");
        }
        Ok(Self {
            settings,
            accounts: Mutex::new(accounts),
        })
    }

    /// Adds `account_id`. Returns `false` if it was already waiting.
    pub async fn add(&self, account_id: &str) -> StoreResult<bool> {
        let mut accounts = self.accounts.lock().await;
        if !accounts.insert(account_id.to_string()) {
            return Ok(false);
        }
        self.save(&accounts).await?;
        debug!(account = %account_id, "queued for offline retry");
        Ok(true)
    }

    /// Empties the set, returning what it held.
    pub async fn take(&self) -> StoreResult<Vec<String>> {
        let mut accounts = self.accounts.lock().await;
        if accounts.is_empty() {
            return Ok(Vec::new());
        }
        let taken = std::mem::take(&mut *accounts);
        self.save(&accounts).await?;
        Ok(taken.into_iter().collect())
    }

    pub async fn accounts(&self) -> Vec<String> {
        self.accounts.lock().await.iter().cloned().collect()
    }

    async fn save(&self, accounts: &BTreeSet<String>) -> StoreResult<()> {
        let value = Value::from(accounts.iter().cloned().collect::<Vec<_>>());
        self.settings.set_setting(keys::OFFLINE_RETRY, value).await
    }
}

/// Retries parked accounts on every offline→online transition.
///
/// Holds the service weakly; the task ends with the service or the
/// connectivity source.
pub(crate) fn watch_connectivity(
    service: Weak<CalendarService>,
    mut states: watch::Receiver<NetworkState>,
) -> JoinHandle<()> {
    let mut online = states.borrow_and_update().online;
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let now = states.borrow_and_update().online;
            let came_online = now && !online;
            online = now;
            if !came_online {
                continue;
            }
            let Some(service) = service.upgrade() else {
                break;
            };
            info!("back online");
            service.retry_offline().await;
        }
        debug!("connectivity watcher stopped");
    })
}
