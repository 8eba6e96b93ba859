//! Key/value settings backed by the Setting store.

use std::sync::Arc;

use calbridge_core::{BoxFuture, Setting};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::store::Store;

/// Well-known setting keys.
pub mod keys {
    /// Whether syncs may run on a metered network. Defaults to `true`.
    pub const SYNC_ON_METERED: &str = "syncOnMetered";
    /// Accounts waiting for a retry once the device is back online.
    pub const OFFLINE_RETRY: &str = "offlineRetry";
}

pub type SettingCallback = Box<dyn Fn(Option<Value>) + Send + Sync>;

/// Read access to settings plus change notification.
pub trait Settings: Send + Sync {
    fn get_setting<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>>;

    /// Calls `callback` with the new value each time `key` changes, `None`
    /// when it was removed. Stops when the returned watch is dropped.
    fn on_change(&self, key: &str, callback: SettingCallback) -> SettingWatch;
}

/// Live subscription created by [`Settings::on_change`].
#[must_use = "dropping the watch stops the notifications"]
pub struct SettingWatch {
    task: JoinHandle<()>,
}

impl Drop for SettingWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    store: Arc<Store<Setting>>,
}

impl StoreSettings {
    pub fn new(store: Arc<Store<Setting>>) -> Self {
        Self { store }
    }

    pub async fn set_setting(&self, key: &str, value: Value) -> StoreResult<()> {
        debug!(key, "setting updated");
        self.store.persist(&Setting::new(key, value)).await
    }

    /// Boolean setting, `default` when unset or not a boolean.
    pub async fn get_bool(&self, key: &str, default: bool) -> StoreResult<bool> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|setting| setting.value.as_bool())
            .unwrap_or(default))
    }
}

impl Settings for StoreSettings {
    fn get_setting<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>> {
        Box::pin(async move { Ok(self.store.get(key).await?.map(|setting| setting.value)) })
    }

    fn on_change(&self, key: &str, callback: SettingCallback) -> SettingWatch {
        let store = self.store.clone();
        let key = key.to_string();
        let mut feed = store.changes();
        let task = tokio::spawn(async move {
            while let Some(change) = feed.recv().await {
                if change.id != key {
                    continue;
                }
                match store.get(&key).await {
                    Ok(setting) => callback(setting.map(|setting| setting.value)),
                    Err(e) => warn!(key = %key, error = %e, "failed to read changed setting"),
                }
            }
        });
        SettingWatch { task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, StoreFactory};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn settings() -> StoreSettings {
        let factory = StoreFactory::new(Database::open("test"));
        StoreSettings::new(factory.store::<Setting>().await.unwrap())
    }

    #[tokio::test]
    async fn bool_settings_fall_back_to_default() {
        let settings = settings().await;
        assert!(settings.get_bool(keys::SYNC_ON_METERED, true).await.unwrap());

        settings
            .set_setting(keys::SYNC_ON_METERED, json!(false))
            .await
            .unwrap();
        assert!(!settings.get_bool(keys::SYNC_ON_METERED, true).await.unwrap());

        settings
            .set_setting(keys::SYNC_ON_METERED, json!("nope"))
            .await
            .unwrap();
        assert!(settings.get_bool(keys::SYNC_ON_METERED, true).await.unwrap());
    }

    #[tokio::test]
    async fn on_change_reports_only_the_watched_key() {
        let settings = settings().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = settings.on_change(
            keys::SYNC_ON_METERED,
            Box::new(move |value| {
                let _ = tx.send(value);
            }),
        );

        settings.set_setting("other", json!(1)).await.unwrap();
        settings
            .set_setting(keys::SYNC_ON_METERED, json!(false))
            .await
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(json!(false)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_watch_stops_notifications() {
        let settings = settings().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch = settings.on_change(
            "k",
            Box::new(move |value| {
                let _ = tx.send(value);
            }),
        );
        drop(watch);
        tokio::task::yield_now().await;

        settings.set_setting("k", json!(1)).await.unwrap();
        // The sender lives in the aborted task, so the channel closes.
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
