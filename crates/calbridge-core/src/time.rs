//! Event times and query windows.
//!
//! [`EventTime`] is either an instant or an all-day date. [`TimeWindow`] is
//! the half-open range used when expanding recurrences into busytimes.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Start or end of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventTime {
    /// A specific instant, stored in UTC.
    DateTime(DateTime<Utc>),
    /// An all-day date.
    AllDay(NaiveDate),
}

impl EventTime {
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self::AllDay(date)
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, Self::AllDay(_))
    }

    /// The instant used for ordering and expansion.
    ///
    /// All-day dates map to midnight UTC.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            Self::DateTime(dt) => *dt,
            Self::AllDay(date) => date.and_time(NaiveTime::MIN).and_utc(),
        }
    }

    /// Builds a time of the same variant at another instant.
    pub fn with_instant(&self, instant: DateTime<Utc>) -> Self {
        match self {
            Self::DateTime(_) => Self::DateTime(instant),
            Self::AllDay(_) => Self::AllDay(instant.date_naive()),
        }
    }
}

impl PartialOrd for EventTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_utc().cmp(&other.to_utc())
    }
}

/// A half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// # Panics
    ///
    /// Panics if `start` is after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start <= end, "TimeWindow start must be <= end");
        Self { start, end }
    }

    /// Returns `None` instead of panicking on an inverted range.
    pub fn try_new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Window reaching `behind` into the past and `ahead` into the future.
    pub fn around(now: DateTime<Utc>, behind: Duration, ahead: Duration) -> Self {
        Self::new(now - behind, now + ahead)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }

    /// True when `[start, end)` intersects the window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }

    /// Same window with the end pushed out to `end`, if later.
    pub fn extend_to(&self, end: DateTime<Utc>) -> Self {
        Self {
            start: self.start,
            end: self.end.max(end),
        }
    }
}
