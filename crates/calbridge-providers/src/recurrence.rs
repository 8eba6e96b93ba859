//! Recurrence expansion into busytimes and alarms.
//!
//! The RRULE is combined with the event's EXDATE and RDATE values, then
//! RECURRENCE-ID overrides move or drop single occurrences.

use calbridge_core::{Alarm, Busytime, Event, EventOverride, EventTime, TimeWindow};
use chrono::{DateTime, Duration, Utc};
use rrule::RRuleSet;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// One concrete occurrence of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Start the rule gave this occurrence; differs from `start` when an
    /// override moved it.
    pub original_start: DateTime<Utc>,
}

impl Occurrence {
    fn at(start: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            start,
            end: start + duration,
            original_start: start,
        }
    }
}

fn ical_utc(time: &EventTime) -> String {
    time.to_utc().format("%Y%m%dT%H%M%SZ").to_string()
}

fn rrule_text(event: &Event, rrule: &str) -> String {
    let mut lines = vec![
        format!("DTSTART:{}", ical_utc(&event.start)),
        format!("RRULE:{}", rrule.trim()),
    ];
    lines.extend(event.exdates.iter().map(|time| format!("EXDATE:{}", ical_utc(time))));
    lines.extend(event.rdates.iter().map(|time| format!("RDATE:{}", ical_utc(time))));
    lines.join("\n")
}

fn find_override(event: &Event, original_start: DateTime<Utc>) -> Option<&EventOverride> {
    event
        .overrides
        .iter()
        .find(|instance| instance.recurrence_id.to_utc() == original_start)
}

/// Occurrences of `event` that overlap `window`, at most `limit` of them.
///
/// A non-recurring event yields exactly one occurrence, its own span,
/// whether or not it falls inside the window.
pub fn expand_occurrences(
    event: &Event,
    window: TimeWindow,
    limit: u16,
) -> ProviderResult<Vec<Occurrence>> {
    let start = event.start.to_utc();
    let duration = (event.end.to_utc() - start).max(Duration::zero());

    let Some(rrule) = event.recurrence.as_deref() else {
        return Ok(vec![Occurrence::at(start, duration)]);
    };

    let set: RRuleSet = rrule_text(event, rrule).parse().map_err(|e| {
        ProviderError::internal(format!("invalid RRULE for event '{}': {}", event.id, e))
    })?;

    // Occurrences starting up to one duration before the window still overlap it.
    let tz: rrule::Tz = Utc.into();
    let after = (window.start - duration - Duration::seconds(1)).with_timezone(&tz);
    let before = (window.end + Duration::seconds(1)).with_timezone(&tz);
    let result = set.clone().after(after).before(before).all(limit);
    if result.limited {
        debug!(event = %event.id, limit, "recurrence expansion hit the limit");
    }

    let mut originals: Vec<DateTime<Utc>> =
        result.dates.iter().map(|dt| dt.with_timezone(&Utc)).collect();

    // Occurrences moved into the window from outside it.
    for instance in &event.overrides {
        let original = instance.recurrence_id.to_utc();
        if instance.cancelled || originals.contains(&original) {
            continue;
        }
        if !window.overlaps(instance.start.to_utc(), instance.end.to_utc()) {
            continue;
        }
        let exact = set
            .clone()
            .after((original - Duration::seconds(1)).with_timezone(&tz))
            .before((original + Duration::seconds(1)).with_timezone(&tz))
            .all(1);
        if exact.dates.iter().any(|dt| dt.with_timezone(&Utc) == original) {
            originals.push(original);
        }
    }

    let mut occurrences: Vec<Occurrence> = originals
        .into_iter()
        .filter_map(|original| match find_override(event, original) {
            Some(instance) if instance.cancelled => None,
            Some(instance) => Some(Occurrence {
                start: instance.start.to_utc(),
                end: instance.end.to_utc().max(instance.start.to_utc()),
                original_start: original,
            }),
            None => Some(Occurrence::at(original, duration)),
        })
        .filter(|occ| {
            window.overlaps(occ.start, occ.end)
                || (occ.start == occ.end && window.contains(occ.start))
        })
        .collect();
    occurrences.sort_by_key(|occ| occ.start);
    Ok(occurrences)
}

/// Busytimes and alarms derived from `event` for `window`.
pub fn materialize(
    event: &Event,
    window: TimeWindow,
    limit: u16,
) -> ProviderResult<(Vec<Busytime>, Vec<Alarm>)> {
    let occurrences = expand_occurrences(event, window, limit)?;
    let mut busytimes = Vec::with_capacity(occurrences.len());
    let mut alarms = Vec::new();

    for occ in occurrences {
        let minutes = match find_override(event, occ.original_start) {
            Some(instance) if !instance.alarms.is_empty() => &instance.alarms,
            _ => &event.alarms,
        };
        let busytime = Busytime {
            id: Busytime::occurrence_id(&event.id, occ.original_start),
            event_id: event.id.clone(),
            calendar_id: event.calendar_id.clone(),
            start: occ.start,
            end: occ.end,
        };
        for minutes in minutes {
            alarms.push(Alarm {
                id: format!("{}-{}", busytime.id, minutes),
                event_id: event.id.clone(),
                busytime_id: busytime.id.clone(),
                trigger: occ.start - Duration::minutes(*minutes),
            });
        }
        busytimes.push(busytime);
    }

    Ok((busytimes, alarms))
}
