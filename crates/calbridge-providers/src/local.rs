//! Device-only provider.

use std::sync::Arc;

use calbridge_core::{Account, BoxFuture, Calendar, Event, ProviderKind};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ProviderError, ProviderResult};
use crate::ical;
use crate::persist::EventStores;
use crate::provider::{CalendarProvider, CapabilitySet, require};
use crate::stream::{SyncEvent, SyncStream};

/// Id of the single calendar a local account owns.
pub const LOCAL_CALENDAR_ID: &str = "local-first";

/// Provider that never touches the network. Writes go straight to the
/// stores.
#[derive(Debug)]
pub struct LocalProvider {
    account_id: String,
    stores: EventStores,
}

impl LocalProvider {
    pub fn new(account_id: impl Into<String>, stores: EventStores) -> Self {
        Self {
            account_id: account_id.into(),
            stores,
        }
    }

    fn calendar(&self) -> Calendar {
        Calendar::new(LOCAL_CALENDAR_ID, &self.account_id, "Local calendar")
    }

    async fn write(&self, mut event: Event) -> ProviderResult<Event> {
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        if event.calendar_id.is_empty() {
            event.calendar_id = LOCAL_CALENDAR_ID.to_string();
        }
        if event.calendar_id != LOCAL_CALENDAR_ID {
            return Err(ProviderError::not_found(format!(
                "calendar '{}' does not belong to local account '{}'",
                event.calendar_id, self.account_id
            ))
            .with_provider(ProviderKind::Local.as_str()));
        }
        let ics = ical::to_ics(&event, &event.id);
        self.stores.write_event(&event, &ics).await?;
        Ok(event)
    }
}

impl CalendarProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn capabilities(&self) -> BoxFuture<'_, ProviderResult<CapabilitySet>> {
        Box::pin(async { Ok(CapabilitySet::local()) })
    }

    fn find_calendars<'a>(
        &'a self,
        _account: &'a Account,
    ) -> BoxFuture<'a, ProviderResult<Vec<Calendar>>> {
        Box::pin(async move {
            let calendar = match self.stores.calendars.get(LOCAL_CALENDAR_ID).await? {
                Some(existing) => existing,
                None => {
                    let calendar = self.calendar();
                    self.stores.calendars.persist(&calendar).await?;
                    info!(account = %self.account_id, "created local calendar");
                    calendar
                }
            };
            Ok(vec![calendar])
        })
    }

    fn sync(self: Arc<Self>, account: Account) -> SyncStream {
        SyncStream::spawn(move |tx| async move {
            debug!(account = %account.id, "local sync is a no-op");
            tx.send(SyncEvent::Started).await;
            tx.send(SyncEvent::Completed(None)).await;
            Ok(())
        })
    }

    fn create_event(&self, event: Event) -> BoxFuture<'_, ProviderResult<Event>> {
        Box::pin(async move {
            require(CapabilitySet::local().can_create_event, "createEvent", self.kind())?;
            self.write(event).await
        })
    }

    fn update_event(&self, event: Event) -> BoxFuture<'_, ProviderResult<Event>> {
        Box::pin(async move {
            require(CapabilitySet::local().can_update_event, "updateEvent", self.kind())?;
            if self.stores.events.get(&event.id).await?.is_none() {
                return Err(ProviderError::not_found(format!("event '{}' not found", event.id))
                    .with_provider(self.kind().as_str()));
            }
            self.write(event).await
        })
    }

    fn delete_event<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            require(CapabilitySet::local().can_delete_event, "deleteEvent", self.kind())?;
            if self.stores.remove_event(id).await? {
                Ok(())
            } else {
                Err(ProviderError::not_found(format!("event '{}' not found", id))
                    .with_provider(self.kind().as_str()))
            }
        })
    }
}
