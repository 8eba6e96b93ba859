//! Stored domain records.
//!
//! Every record kind has exactly one [`EntityKind`] tag. Stores are keyed by
//! that tag, and the tag's canonical name is what travels over the bridge
//! when a UI asks for a store by name.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::EventTime;

/// The closed set of persisted record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Alarm,
    Busytime,
    Calendar,
    Event,
    IcalComponent,
    Setting,
}

impl EntityKind {
    /// All kinds, in lock order.
    pub const ALL: [EntityKind; 7] = [
        Self::Account,
        Self::Alarm,
        Self::Busytime,
        Self::Calendar,
        Self::Event,
        Self::IcalComponent,
        Self::Setting,
    ];

    /// Canonical name, also the collection name in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "Account",
            Self::Alarm => "Alarm",
            Self::Busytime => "Busytime",
            Self::Calendar => "Calendar",
            Self::Event => "Event",
            Self::IcalComponent => "IcalComponent",
            Self::Setting => "Setting",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a kind name is not part of the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A record that lives in exactly one store.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The store this record belongs to.
    const KIND: EntityKind;

    /// Stable identifier, unique within the kind.
    fn id(&self) -> &str;
}

/// Backend variant of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Device-only calendar, never synchronized.
    Local,
    /// CalDAV server.
    Caldav,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Caldav => "caldav",
        }
    }

    /// Whether the backend talks to the network.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque credentials handed to remote clients.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A configured calendar account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Token returned by the last completed sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl Account {
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: ProviderKind::Local,
            url: None,
            credentials: None,
            sync_token: None,
        }
    }

    pub fn caldav(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: ProviderKind::Caldav,
            url: Some(url.into()),
            credentials: None,
            sync_token: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

impl Entity for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A calendar collection belonging to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub account_id: String,
    /// Server-side identifier (the collection href for CalDAV).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Collection tag from the last sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl Calendar {
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            remote_id: None,
            name: name.into(),
            color: None,
            sync_token: None,
        }
    }
}

impl Entity for Calendar {
    const KIND: EntityKind = EntityKind::Calendar;

    fn id(&self) -> &str {
        &self.id
    }
}

/// One occurrence of a recurring event that was moved, retitled or
/// cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOverride {
    /// Start of the occurrence this replaces.
    pub recurrence_id: EventTime,
    pub start: EventTime,
    pub end: EventTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alarms: Vec<i64>,
    #[serde(default)]
    pub cancelled: bool,
}

impl EventOverride {
    /// Moves the occurrence starting at `recurrence_id` to `start`..`end`.
    pub fn moved(recurrence_id: EventTime, start: EventTime, end: EventTime) -> Self {
        Self {
            recurrence_id,
            start,
            end,
            title: None,
            alarms: Vec::new(),
            cancelled: false,
        }
    }
}

/// A calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub calendar_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    /// RRULE value, without the `RRULE:` prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    /// Occurrences removed from the rule (EXDATE).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exdates: Vec<EventTime>,
    /// Occurrences added to the rule (RDATE).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rdates: Vec<EventTime>,
    /// Single occurrences changed by a RECURRENCE-ID component.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<EventOverride>,
    /// Minutes before start at which alarms fire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alarms: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        calendar_id: impl Into<String>,
        title: impl Into<String>,
        start: EventTime,
        end: EventTime,
    ) -> Self {
        Self {
            id: id.into(),
            calendar_id: calendar_id.into(),
            title: title.into(),
            description: None,
            location: None,
            start,
            end,
            recurrence: None,
            exdates: Vec::new(),
            rdates: Vec::new(),
            overrides: Vec::new(),
            alarms: Vec::new(),
            href: None,
            etag: None,
        }
    }

    pub fn with_exdate(mut self, occurrence: EventTime) -> Self {
        self.exdates.push(occurrence);
        self
    }

    pub fn with_override(mut self, instance: EventOverride) -> Self {
        self.overrides.push(instance);
        self
    }

    pub fn with_recurrence(mut self, rrule: impl Into<String>) -> Self {
        self.recurrence = Some(rrule.into());
        self
    }

    pub fn with_alarm(mut self, minutes_before: i64) -> Self {
        self.alarms.push(minutes_before);
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }
}

impl Entity for Event {
    const KIND: EntityKind = EntityKind::Event;

    fn id(&self) -> &str {
        &self.id
    }
}

/// One materialized occurrence of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Busytime {
    pub id: String,
    pub event_id: String,
    pub calendar_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Busytime {
    /// Occurrence ids are derived from the event id and the start instant so
    /// re-expanding the same range is idempotent.
    pub fn occurrence_id(event_id: &str, start: DateTime<Utc>) -> String {
        format!("{}-{}", event_id, start.format("%Y%m%dT%H%M%SZ"))
    }
}

impl Entity for Busytime {
    const KIND: EntityKind = EntityKind::Busytime;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A reminder attached to a busytime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub event_id: String,
    pub busytime_id: String,
    pub trigger: DateTime<Utc>,
}

impl Entity for Alarm {
    const KIND: EntityKind = EntityKind::Alarm;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Raw iCalendar data for an event, kept for recurrence expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcalComponent {
    /// Same id as the owning event.
    pub id: String,
    pub ical: String,
    /// End of the last range busytimes were expanded for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_until: Option<DateTime<Utc>>,
}

impl Entity for IcalComponent {
    const KIND: EntityKind = EntityKind::IcalComponent;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A persisted key/value setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: String,
    pub value: serde_json::Value,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: key.into(),
            value,
        }
    }
}

impl Entity for Setting {
    const KIND: EntityKind = EntityKind::Setting;

    fn id(&self) -> &str {
        &self.id
    }
}
