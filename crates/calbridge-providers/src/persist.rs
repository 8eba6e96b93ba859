//! Atomic persistence of events and their derived records.
//!
//! An event is never written alone: its raw iCalendar component, its
//! busytimes and its alarms land in the same transaction, and stale
//! busytimes/alarms from a previous version are removed in it too.

use std::sync::Arc;

use calbridge_core::{Alarm, Busytime, Calendar, EntityKind, Event, IcalComponent};
use calbridge_store::{Database, Store, StoreFactory, Transaction, TransactionMode};
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::ProviderResult;
use crate::recurrence;

const EVENT_KINDS: [EntityKind; 4] = [
    EntityKind::Alarm,
    EntityKind::Busytime,
    EntityKind::Event,
    EntityKind::IcalComponent,
];

/// Typed handles on the stores an event touches.
#[derive(Debug, Clone)]
pub struct EventStores {
    pub calendars: Arc<Store<Calendar>>,
    pub events: Arc<Store<Event>>,
    pub components: Arc<Store<IcalComponent>>,
    pub busytimes: Arc<Store<Busytime>>,
    pub alarms: Arc<Store<Alarm>>,
    config: SyncConfig,
}

impl EventStores {
    pub async fn from_factory(factory: &StoreFactory, config: SyncConfig) -> ProviderResult<Self> {
        Ok(Self {
            calendars: factory.store::<Calendar>().await?,
            events: factory.store::<Event>().await?,
            components: factory.store::<IcalComponent>().await?,
            busytimes: factory.store::<Busytime>().await?,
            alarms: factory.store::<Alarm>().await?,
            config,
        })
    }

    pub fn database(&self) -> &Database {
        self.events.database()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Upserts `event` with `ical` as its raw component and rematerializes
    /// its busytimes and alarms for the configured window.
    pub async fn write_event(&self, event: &Event, ical: &str) -> ProviderResult<()> {
        let window = self.config.window();
        let (busytimes, alarms) =
            recurrence::materialize(event, window, self.config.occurrence_limit)?;

        let mut tx = self
            .database()
            .transaction(&EVENT_KINDS, TransactionMode::ReadWrite)
            .await;
        self.clear_derived(&mut tx, &event.id)?;

        self.events.persist_in(&mut tx, event)?;
        self.components.persist_in(
            &mut tx,
            &IcalComponent {
                id: event.id.clone(),
                ical: ical.to_string(),
                expanded_until: Some(window.end),
            },
        )?;
        for busytime in &busytimes {
            self.busytimes.persist_in(&mut tx, busytime)?;
        }
        for alarm in &alarms {
            self.alarms.persist_in(&mut tx, alarm)?;
        }
        tx.commit()?;

        debug!(
            event = %event.id,
            busytimes = busytimes.len(),
            alarms = alarms.len(),
            "event written"
        );
        Ok(())
    }

    /// Removes `id` and everything derived from it. Returns whether the
    /// event existed.
    pub async fn remove_event(&self, id: &str) -> ProviderResult<bool> {
        let mut tx = self
            .database()
            .transaction(&EVENT_KINDS, TransactionMode::ReadWrite)
            .await;
        self.clear_derived(&mut tx, id)?;
        self.components.remove_in(&mut tx, id)?;
        let existed = self.events.remove_in(&mut tx, id)?;
        tx.commit()?;
        debug!(event = %id, existed, "event removed");
        Ok(existed)
    }

    pub async fn events_in_calendar(&self, calendar_id: &str) -> ProviderResult<Vec<Event>> {
        let tx = self
            .database()
            .transaction(&[EntityKind::Event], TransactionMode::ReadOnly)
            .await;
        Ok(self
            .events
            .filter_in(&tx, |event| event.calendar_id == calendar_id)?)
    }

    fn clear_derived(&self, tx: &mut Transaction, event_id: &str) -> ProviderResult<()> {
        for busytime in self
            .busytimes
            .filter_in(tx, |busytime| busytime.event_id == event_id)?
        {
            self.busytimes.remove_in(tx, &busytime.id)?;
        }
        for alarm in self.alarms.filter_in(tx, |alarm| alarm.event_id == event_id)? {
            self.alarms.remove_in(tx, &alarm.id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ical;
    use calbridge_core::EventTime;
    use chrono::{Duration, Utc};

    async fn stores() -> EventStores {
        let factory = StoreFactory::new(Database::open("test"));
        EventStores::from_factory(&factory, SyncConfig::default())
            .await
            .unwrap()
    }

    fn daily(id: &str, count: u32) -> Event {
        let start = Utc::now() + Duration::days(1);
        Event::new(
            id,
            "cal-1",
            "Daily",
            EventTime::from_utc(start),
            EventTime::from_utc(start + Duration::minutes(30)),
        )
        .with_recurrence(format!("FREQ=DAILY;COUNT={}", count))
        .with_alarm(5)
    }

    #[tokio::test]
    async fn write_materializes_busytimes_and_alarms() {
        let stores = stores().await;
        let event = daily("evt-1", 3);
        stores
            .write_event(&event, &ical::to_ics(&event, "evt-1"))
            .await
            .unwrap();

        assert_eq!(stores.busytimes.all().await.unwrap().len(), 3);
        assert_eq!(stores.alarms.all().await.unwrap().len(), 3);
        let component = stores.components.get("evt-1").await.unwrap().unwrap();
        assert!(component.ical.contains("RRULE:FREQ=DAILY;COUNT=3"));
        assert!(component.expanded_until.is_some());
    }

    #[tokio::test]
    async fn rewrite_replaces_stale_occurrences() {
        let stores = stores().await;
        let event = daily("evt-1", 4);
        stores.write_event(&event, "").await.unwrap();
        let shorter = daily("evt-1", 2);
        stores.write_event(&shorter, "").await.unwrap();

        assert_eq!(stores.busytimes.all().await.unwrap().len(), 2);
        assert_eq!(stores.alarms.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_clears_everything_for_the_event() {
        let stores = stores().await;
        stores.write_event(&daily("evt-1", 2), "").await.unwrap();
        stores.write_event(&daily("evt-2", 2), "").await.unwrap();

        assert!(stores.remove_event("evt-1").await.unwrap());
        assert!(!stores.remove_event("evt-1").await.unwrap());

        let busytimes = stores.busytimes.all().await.unwrap();
        assert_eq!(busytimes.len(), 2);
        assert!(busytimes.iter().all(|b| b.event_id == "evt-2"));
        assert!(stores.components.get("evt-1").await.unwrap().is_none());
        assert_eq!(stores.events_in_calendar("cal-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_rule_writes_nothing() {
        let stores = stores().await;
        let event = daily("evt-1", 2).with_recurrence("FREQ=NEVER");
        assert!(stores.write_event(&event, "").await.is_err());
        assert!(stores.events.all().await.unwrap().is_empty());
    }
}
