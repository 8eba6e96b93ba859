//! Provider for server-backed accounts.
//!
//! [`RemoteProvider`] owns the sync algorithm and the store writes; the
//! wire protocol lives behind [`RemoteClient`]. Ids are namespaced by
//! account: calendars are `"{account}:{collection href}"` and events are
//! `"{account}:{resource href}"`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use calbridge_core::{Account, BoxFuture, Calendar, Event, ProviderKind};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectivity::Connectivity;
use crate::error::{ProviderError, ProviderResult};
use crate::ical;
use crate::persist::EventStores;
use crate::provider::{CalendarProvider, CapabilitySet, require};
use crate::stream::{SyncEvent, SyncSender, SyncStream};

/// A calendar collection as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCalendar {
    pub href: String,
    pub name: String,
    pub color: Option<String>,
    /// Collection tag; changes whenever any resource in it changes.
    pub ctag: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFeatures {
    pub can_write: bool,
}

/// Request for the changes of one calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchChanges {
    pub calendar_href: String,
    pub since_token: Option<String>,
    /// `href → etag` of every resource already stored.
    pub known_etags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub href: String,
    pub etag: Option<String>,
    pub ical: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub token: Option<String>,
    /// New or modified resources.
    pub upserts: Vec<RemoteEvent>,
    /// Known hrefs the server no longer has.
    pub removed: Vec<String>,
}

/// A local write to replay on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOp {
    Put {
        href: String,
        ical: String,
        /// Expected current etag; `None` creates.
        etag: Option<String>,
    },
    Delete {
        href: String,
        etag: Option<String>,
    },
}

impl PushOp {
    pub fn href(&self) -> &str {
        match self {
            Self::Put { href, .. } | Self::Delete { href, .. } => href,
        }
    }
}

/// Wire-level collaborator of [`RemoteProvider`].
pub trait RemoteClient: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Caldav
    }

    fn server_features(&self) -> BoxFuture<'_, ProviderResult<ServerFeatures>>;

    fn list_calendars(&self) -> BoxFuture<'_, ProviderResult<Vec<RemoteCalendar>>>;

    fn fetch_changes(&self, request: FetchChanges) -> BoxFuture<'_, ProviderResult<ChangeSet>>;

    /// Applies `ops` in order. Returns the new etag of each op, `None`
    /// for deletions or when the server did not report one.
    fn push_changes(&self, ops: Vec<PushOp>) -> BoxFuture<'_, ProviderResult<Vec<Option<String>>>>;
}

pub struct RemoteProvider<C> {
    account_id: String,
    client: C,
    stores: EventStores,
    connectivity: Arc<dyn Connectivity>,
    capabilities: OnceCell<CapabilitySet>,
}

impl<C> std::fmt::Debug for RemoteProvider<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProvider")
            .field("account_id", &self.account_id)
            .field("capabilities", &self.capabilities.get())
            .finish()
    }
}

impl<C: RemoteClient> RemoteProvider<C> {
    pub fn new(
        account_id: impl Into<String>,
        client: C,
        stores: EventStores,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            client,
            stores,
            connectivity,
            capabilities: OnceCell::new(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn calendar_id(&self, href: &str) -> String {
        format!("{}:{}", self.account_id, href)
    }

    fn event_id(&self, href: &str) -> String {
        format!("{}:{}", self.account_id, href)
    }

    fn tag(&self, error: ProviderError) -> ProviderError {
        error.with_provider(self.client.kind().as_str())
    }

    fn ensure_online(&self) -> ProviderResult<()> {
        if self.connectivity.state().online {
            Ok(())
        } else {
            Err(self.tag(ProviderError::offline("device is offline")))
        }
    }

    async fn cached_capabilities(&self) -> ProviderResult<CapabilitySet> {
        let caps = self
            .capabilities
            .get_or_try_init(|| async {
                self.ensure_online()?;
                let features = self.client.server_features().await?;
                debug!(account = %self.account_id, ?features, "server features");
                Ok::<_, ProviderError>(if features.can_write {
                    CapabilitySet::read_write_remote()
                } else {
                    CapabilitySet::read_only_remote()
                })
            })
            .await?;
        Ok(*caps)
    }

    /// Persists the server's calendar list and drops calendars the server
    /// no longer has, along with their events.
    async fn store_calendars(&self, remote: &[RemoteCalendar]) -> ProviderResult<Vec<Calendar>> {
        let existing: HashMap<String, Calendar> = self
            .stores
            .calendars
            .all()
            .await?
            .into_iter()
            .filter(|calendar| calendar.account_id == self.account_id)
            .map(|calendar| (calendar.id.clone(), calendar))
            .collect();

        let mut calendars = Vec::with_capacity(remote.len());
        for entry in remote {
            let id = self.calendar_id(&entry.href);
            let mut calendar = existing
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Calendar::new(&id, &self.account_id, &entry.name));
            calendar.name = entry.name.clone();
            calendar.color = entry.color.clone();
            calendar.remote_id = Some(entry.href.clone());
            self.stores.calendars.persist(&calendar).await?;
            calendars.push(calendar);
        }

        let listed: HashSet<String> = calendars.iter().map(|c| c.id.clone()).collect();
        for id in existing.keys().filter(|id| !listed.contains(*id)) {
            info!(calendar = %id, "calendar removed on server");
            for event in self.stores.events_in_calendar(id).await? {
                self.stores.remove_event(&event.id).await?;
            }
            self.stores.calendars.remove(id).await?;
        }
        Ok(calendars)
    }

    async fn sync_calendar(
        &self,
        calendar: &mut Calendar,
        remote: &RemoteCalendar,
        tx: &SyncSender,
        synced: &mut usize,
    ) -> ProviderResult<()> {
        if remote.ctag.is_some() && remote.ctag == calendar.sync_token {
            debug!(calendar = %calendar.id, "collection tag unchanged");
            return Ok(());
        }

        let stored = self.stores.events_in_calendar(&calendar.id).await?;
        let known_etags = stored
            .iter()
            .filter_map(|event| Some((event.href.clone()?, event.etag.clone().unwrap_or_default())))
            .collect();

        let changes = self
            .client
            .fetch_changes(FetchChanges {
                calendar_href: remote.href.clone(),
                since_token: calendar.sync_token.clone(),
                known_etags,
            })
            .await?;
        debug!(
            calendar = %calendar.id,
            upserts = changes.upserts.len(),
            removed = changes.removed.len(),
            "changes fetched"
        );

        for item in &changes.upserts {
            let id = self.event_id(&item.href);
            match ical::parse_event(&item.ical, &id, &calendar.id) {
                Ok(parsed) => {
                    let mut event = parsed.event;
                    event.href = Some(item.href.clone());
                    event.etag = item.etag.clone();
                    self.stores.write_event(&event, &item.ical).await?;
                }
                Err(e) => {
                    warn!(href = %item.href, error = %e, "skipping unparseable resource");
                    continue;
                }
            }
            *synced += 1;
            tx.send(SyncEvent::ItemSynced(*synced)).await;
        }

        for href in &changes.removed {
            self.stores.remove_event(&self.event_id(href)).await?;
            *synced += 1;
            tx.send(SyncEvent::ItemSynced(*synced)).await;
        }

        calendar.sync_token = changes.token.or_else(|| remote.ctag.clone());
        self.stores.calendars.persist(calendar).await?;
        Ok(())
    }

    async fn run_sync(&self, account: &Account, tx: &SyncSender) -> ProviderResult<Option<String>> {
        self.ensure_online()?;
        let remote = self.client.list_calendars().await?;
        let mut calendars = self.store_calendars(&remote).await?;

        let mut synced = 0;
        for (calendar, entry) in calendars.iter_mut().zip(&remote) {
            self.sync_calendar(calendar, entry, tx, &mut synced).await?;
        }

        let token = calendars
            .iter()
            .map(|calendar| calendar.sync_token.clone().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        info!(account = %account.id, items = synced, "sync finished");
        Ok(Some(token))
    }

    async fn calendar_href(&self, calendar_id: &str) -> ProviderResult<String> {
        self.stores
            .calendars
            .get(calendar_id)
            .await?
            .filter(|calendar| calendar.account_id == self.account_id)
            .and_then(|calendar| calendar.remote_id)
            .ok_or_else(|| {
                self.tag(ProviderError::not_found(format!(
                    "calendar '{}' not found",
                    calendar_id
                )))
            })
    }

    async fn existing(&self, id: &str) -> ProviderResult<(Event, String)> {
        let event = self
            .stores
            .events
            .get(id)
            .await?
            .ok_or_else(|| self.tag(ProviderError::not_found(format!("event '{}' not found", id))))?;
        let href = event.href.clone().ok_or_else(|| {
            self.tag(ProviderError::internal(format!("event '{}' has no href", id)))
        })?;
        Ok((event, href))
    }

    async fn push_one(&self, op: PushOp) -> ProviderResult<Option<String>> {
        let href = op.href().to_string();
        let mut etags = self.client.push_changes(vec![op]).await?;
        if etags.len() != 1 {
            warn!(href = %href, results = etags.len(), "unexpected push result count");
        }
        Ok(etags.pop().flatten())
    }
}

impl<C: RemoteClient> CalendarProvider for RemoteProvider<C> {
    fn kind(&self) -> ProviderKind {
        self.client.kind()
    }

    fn capabilities(&self) -> BoxFuture<'_, ProviderResult<CapabilitySet>> {
        Box::pin(self.cached_capabilities())
    }

    fn find_calendars<'a>(
        &'a self,
        _account: &'a Account,
    ) -> BoxFuture<'a, ProviderResult<Vec<Calendar>>> {
        Box::pin(async move {
            self.ensure_online()?;
            let remote = self.client.list_calendars().await?;
            self.store_calendars(&remote).await
        })
    }

    fn sync(self: Arc<Self>, account: Account) -> SyncStream {
        SyncStream::spawn(move |tx| async move {
            tx.send(SyncEvent::Started).await;
            let token = self
                .run_sync(&account, &tx)
                .await
                .map_err(|e| self.tag(e))?;
            tx.send(SyncEvent::Completed(token)).await;
            Ok(())
        })
    }

    fn create_event(&self, mut event: Event) -> BoxFuture<'_, ProviderResult<Event>> {
        Box::pin(async move {
            self.ensure_online()?;
            require(self.cached_capabilities().await?.can_create_event, "createEvent", self.kind())?;

            let collection = self.calendar_href(&event.calendar_id).await?;
            let uid = Uuid::new_v4().to_string();
            let href = format!("{}/{}.ics", collection.trim_end_matches('/'), uid);
            let ics = ical::to_ics(&event, &uid);

            let etag = self
                .push_one(PushOp::Put {
                    href: href.clone(),
                    ical: ics.clone(),
                    etag: None,
                })
                .await?;
            event.id = self.event_id(&href);
            event.href = Some(href);
            event.etag = etag;
            self.stores.write_event(&event, &ics).await?;
            Ok(event)
        })
    }

    fn update_event(&self, mut event: Event) -> BoxFuture<'_, ProviderResult<Event>> {
        Box::pin(async move {
            self.ensure_online()?;
            require(self.cached_capabilities().await?.can_update_event, "updateEvent", self.kind())?;

            let (existing, href) = self.existing(&event.id).await?;
            let uid = self
                .stores
                .components
                .get(&event.id)
                .await?
                .and_then(|component| ical::ical_uid(&component.ical))
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let ics = ical::to_ics(&event, &uid);

            let etag = self
                .push_one(PushOp::Put {
                    href: href.clone(),
                    ical: ics.clone(),
                    etag: existing.etag.clone(),
                })
                .await?;
            event.calendar_id = existing.calendar_id;
            event.href = Some(href);
            event.etag = etag;
            self.stores.write_event(&event, &ics).await?;
            Ok(event)
        })
    }

    fn delete_event<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.ensure_online()?;
            require(self.cached_capabilities().await?.can_delete_event, "deleteEvent", self.kind())?;

            let (existing, href) = self.existing(id).await?;
            self.push_one(PushOp::Delete {
                href,
                etag: existing.etag,
            })
            .await?;
            self.stores.remove_event(id).await?;
            Ok(())
        })
    }
}
