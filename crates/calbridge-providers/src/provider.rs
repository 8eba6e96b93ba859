//! CalendarProvider trait definition.
//!
//! A provider is the backend of one account. It is constructed per account
//! and writes everything it learns into the stores handed to it; callers
//! read results back through the [`StoreFactory`].

use std::sync::Arc;

use calbridge_core::{Account, BoxFuture, Calendar, Event, ProviderKind};
use calbridge_store::StoreFactory;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{ProviderError, ProviderResult};
use crate::local::LocalProvider;
use crate::persist::EventStores;
use crate::stream::SyncStream;

/// What a provider, calendar or event allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub can_sync: bool,
    pub can_create_event: bool,
    pub can_update_event: bool,
    pub can_delete_event: bool,
    pub can_push: bool,
}

impl CapabilitySet {
    /// Device-only storage: every edit, no sync.
    pub fn local() -> Self {
        Self {
            can_sync: false,
            can_create_event: true,
            can_update_event: true,
            can_delete_event: true,
            can_push: false,
        }
    }

    /// A server that can be synced but not written to.
    pub fn read_only_remote() -> Self {
        Self {
            can_sync: true,
            ..Self::default()
        }
    }

    /// A writable server.
    pub fn read_write_remote() -> Self {
        Self {
            can_sync: true,
            can_create_event: true,
            can_update_event: true,
            can_delete_event: true,
            can_push: true,
        }
    }
}

/// The core abstraction for calendar backends.
///
/// Methods return boxed futures so the trait stays object safe; the worker
/// holds providers as `Arc<dyn CalendarProvider>`.
pub trait CalendarProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Account-wide capabilities.
    fn capabilities(&self) -> BoxFuture<'_, ProviderResult<CapabilitySet>>;

    fn calendar_capabilities<'a>(
        &'a self,
        _calendar: &'a Calendar,
    ) -> BoxFuture<'a, ProviderResult<CapabilitySet>> {
        self.capabilities()
    }

    fn event_capabilities<'a>(
        &'a self,
        _event: &'a Event,
    ) -> BoxFuture<'a, ProviderResult<CapabilitySet>> {
        self.capabilities()
    }

    /// Discovers the account's calendars and persists them.
    fn find_calendars<'a>(
        &'a self,
        account: &'a Account,
    ) -> BoxFuture<'a, ProviderResult<Vec<Calendar>>>;

    /// Starts a sync from `account.sync_token`.
    ///
    /// The returned stream yields [`SyncEvent::Started`] first and
    /// [`SyncEvent::Completed`] last, unless an error ends it early.
    ///
    /// [`SyncEvent::Started`]: crate::SyncEvent::Started
    /// [`SyncEvent::Completed`]: crate::SyncEvent::Completed
    fn sync(self: Arc<Self>, account: Account) -> SyncStream;

    fn create_event(&self, event: Event) -> BoxFuture<'_, ProviderResult<Event>>;

    fn update_event(&self, event: Event) -> BoxFuture<'_, ProviderResult<Event>>;

    fn delete_event<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ProviderResult<()>>;
}

/// Builds the provider for `account`.
pub async fn build_provider(
    account: &Account,
    factory: &StoreFactory,
    config: SyncConfig,
    connectivity: Arc<dyn Connectivity>,
) -> ProviderResult<Arc<dyn CalendarProvider>> {
    let stores = EventStores::from_factory(factory, config).await?;
    match account.provider {
        ProviderKind::Local => Ok(Arc::new(LocalProvider::new(&account.id, stores))),
        #[cfg(feature = "caldav")]
        ProviderKind::Caldav => {
            let client = crate::caldav::CalDavClient::new(crate::caldav::CalDavConfig::from_account(account)?)?;
            Ok(Arc::new(crate::remote::RemoteProvider::new(
                &account.id,
                client,
                stores,
                connectivity,
            )))
        }
        #[cfg(not(feature = "caldav"))]
        ProviderKind::Caldav => {
            let _ = connectivity;
            Err(ProviderError::invalid_server("CalDAV support is not compiled in")
                .with_provider(account.provider.as_str()))
        }
    }
}

/// Fails with `PermissionDenied` unless `allowed`.
pub(crate) fn require(allowed: bool, operation: &str, kind: ProviderKind) -> ProviderResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(
            ProviderError::permission_denied(format!("{} is not allowed", operation))
                .with_provider(kind.as_str()),
        )
    }
}
