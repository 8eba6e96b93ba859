//! iCalendar conversion for [`Event`] records.
//!
//! Parsing reads the component tree of a resource: the master VEVENT (the
//! one without a RECURRENCE-ID) becomes the event, its VALARM children give
//! the alarm offsets, and sibling VEVENTs with a RECURRENCE-ID become
//! overrides of single occurrences.

use std::sync::LazyLock;

use calbridge_core::{Event, EventOverride, EventTime};
use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use icalendar::parser::{self, read_calendar, unfold};
use icalendar::{
    Alarm, Calendar, CalendarDateTime, Component, DatePerhapsTime, EventLike, Property, Trigger,
    ValueType,
};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};

/// `TRIGGER` durations: `-PT15M`, `-P1D`, `-P1DT2H`, `PT0S`, `-P1W`.
static TRIGGER_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-])?P(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$")
        .expect("trigger regex should be valid")
});

/// An event decoded from an iCalendar resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub uid: String,
    pub event: Event,
}

fn convert_time(value: DatePerhapsTime) -> EventTime {
    match value {
        DatePerhapsTime::Date(date) => EventTime::from_date(date),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => EventTime::from_utc(dt),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => {
            EventTime::from_utc(Utc.from_utc_datetime(&naive))
        }
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            debug!(tzid = %tzid, "treating zoned time as UTC");
            EventTime::from_utc(Utc.from_utc_datetime(&date_time))
        }
    }
}

/// Minutes before start encoded by a TRIGGER value. Triggers after the
/// start come back negative.
pub fn trigger_minutes(value: &str) -> Option<i64> {
    let caps = TRIGGER_DURATION.captures(value.trim())?;
    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0)
    };
    let minutes =
        part(2) * 7 * 24 * 60 + part(3) * 24 * 60 + part(4) * 60 + part(5) + part(6) / 60;
    let before = caps.get(1).is_some_and(|sign| sign.as_str() == "-");
    Some(if before { minutes } else { -minutes })
}

fn has_param(prop: &parser::Property<'_>, key: &str, value: &str) -> bool {
    prop.params
        .iter()
        .any(|param| param.key.as_ref() == key && param.val.as_ref().map(|v| v.as_ref()) == Some(value))
}

fn text(component: &parser::Component<'_>, name: &str) -> Option<String> {
    component.find_prop(name).map(|prop| prop.val.to_string())
}

fn time(component: &parser::Component<'_>, name: &str) -> Option<EventTime> {
    let prop = component.find_prop(name)?;
    DatePerhapsTime::try_from(prop).ok().map(convert_time)
}

/// Every value of the multi-valued `name` properties (EXDATE, RDATE).
fn time_list(component: &parser::Component<'_>, name: &str) -> Vec<EventTime> {
    component
        .properties
        .iter()
        .filter(|prop| prop.name.as_ref() == name)
        .flat_map(|prop| {
            let is_date = has_param(prop, "VALUE", "DATE");
            prop.val
                .as_ref()
                .split(',')
                .filter_map(move |value| {
                    let value = value.trim();
                    let parsed = if is_date {
                        NaiveDate::parse_from_str(value, "%Y%m%d")
                            .ok()
                            .map(EventTime::from_date)
                    } else {
                        NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y%m%dT%H%M%S")
                            .ok()
                            .map(|dt| EventTime::from_utc(dt.and_utc()))
                    };
                    if parsed.is_none() && !value.is_empty() {
                        debug!(value, "unsupported date value");
                    }
                    parsed
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Offsets of the VALARM children of `component`.
fn alarm_minutes(component: &parser::Component<'_>) -> Vec<i64> {
    component
        .components
        .iter()
        .filter(|child| child.name == "VALARM")
        .filter_map(|alarm| {
            let trigger = alarm.find_prop("TRIGGER")?;
            if has_param(trigger, "VALUE", "DATE-TIME") {
                return None;
            }
            let minutes = trigger_minutes(trigger.val.as_ref());
            if minutes.is_none() {
                debug!(value = %trigger.val.as_ref(), "unsupported alarm trigger");
            }
            minutes
        })
        .collect()
}

fn default_end(start: EventTime, duration: Option<Duration>) -> EventTime {
    match (start, duration) {
        (EventTime::AllDay(date), None) => EventTime::from_date(date + Duration::days(1)),
        (start, Some(duration)) => start.with_instant(start.to_utc() + duration),
        (start, None) => start,
    }
}

fn parse_override(
    component: &parser::Component<'_>,
    master: &Event,
) -> Option<EventOverride> {
    let recurrence_id = time(component, "RECURRENCE-ID")?;
    let start = time(component, "DTSTART").unwrap_or(recurrence_id);
    let duration = master.end.to_utc() - master.start.to_utc();
    let end = time(component, "DTEND").unwrap_or_else(|| default_end(start, Some(duration)));
    Some(EventOverride {
        recurrence_id,
        start,
        end,
        title: text(component, "SUMMARY").filter(|title| *title != master.title),
        alarms: alarm_minutes(component),
        cancelled: text(component, "STATUS").is_some_and(|status| status == "CANCELLED"),
    })
}

/// Decodes the master event of `ics` as `id` in `calendar_id`.
pub fn parse_event(ics: &str, id: &str, calendar_id: &str) -> ProviderResult<ParsedEvent> {
    let unfolded = unfold(ics);
    let calendar = read_calendar(&unfolded).map_err(|e| {
        warn!(id, error = %e, "failed to parse iCalendar data");
        ProviderError::invalid_server(format!("unparseable iCalendar data for {}: {}", id, e))
    })?;

    let vevents: Vec<&parser::Component<'_>> = calendar
        .components
        .iter()
        .filter(|component| component.name == "VEVENT")
        .collect();
    let master = vevents
        .iter()
        .find(|component| component.find_prop("RECURRENCE-ID").is_none())
        .ok_or_else(|| ProviderError::invalid_server(format!("no VEVENT in {}", id)))?;

    let uid = text(master, "UID")
        .ok_or_else(|| ProviderError::invalid_server(format!("VEVENT without UID in {}", id)))?;
    let start = time(master, "DTSTART")
        .ok_or_else(|| ProviderError::invalid_server(format!("VEVENT without DTSTART in {}", id)))?;
    let end = time(master, "DTEND").unwrap_or_else(|| default_end(start, None));

    let mut event = Event::new(
        id,
        calendar_id,
        text(master, "SUMMARY").unwrap_or_else(|| "(No title)".to_string()),
        start,
        end,
    );
    event.description = text(master, "DESCRIPTION");
    event.location = text(master, "LOCATION");
    event.recurrence = text(master, "RRULE");
    event.alarms = alarm_minutes(master);
    if event.recurrence.is_some() {
        event.exdates = time_list(master, "EXDATE");
        event.rdates = time_list(master, "RDATE");
        event.overrides = vevents
            .iter()
            .filter(|component| text(component, "UID").as_deref() == Some(uid.as_str()))
            .filter_map(|component| parse_override(component, &event))
            .collect();
    }

    Ok(ParsedEvent { uid, event })
}

/// UID of the master event, if the data parses.
pub fn ical_uid(ics: &str) -> Option<String> {
    let unfolded = unfold(ics);
    let calendar = read_calendar(&unfolded).ok()?;
    calendar
        .components
        .iter()
        .filter(|component| component.name == "VEVENT")
        .find_map(|component| text(component, "UID"))
}

fn time_property(name: &str, time: &EventTime) -> Property {
    match time {
        EventTime::AllDay(date) => {
            let mut prop = Property::new(name, date.format("%Y%m%d").to_string());
            prop.append_parameter(ValueType::Date);
            prop
        }
        EventTime::DateTime(dt) => Property::new(name, dt.format("%Y%m%dT%H%M%SZ").to_string()),
    }
}

fn add_alarms(ics_event: &mut icalendar::Event, uid: &str, title: &str, alarms: &[i64]) {
    for minutes in alarms {
        let trigger = Trigger::before_start(Duration::minutes(*minutes));
        let mut alarm = Alarm::display(title, trigger);
        alarm.add_property("UID", format!("{}_alarm_{}", uid, minutes));
        ics_event.alarm(alarm);
    }
}

fn override_component(event: &Event, uid: &str, instance: &EventOverride) -> icalendar::Event {
    let title = instance.title.as_deref().unwrap_or(&event.title);
    let mut ics_event = icalendar::Event::new();
    ics_event.uid(uid);
    ics_event.summary(title);
    ics_event.append_property(time_property("RECURRENCE-ID", &instance.recurrence_id));
    ics_event.append_property(time_property("DTSTART", &instance.start));
    ics_event.append_property(time_property("DTEND", &instance.end));
    if instance.cancelled {
        ics_event.add_property("STATUS", "CANCELLED");
    }
    add_alarms(&mut ics_event, uid, title, &instance.alarms);
    ics_event.done()
}

/// Encodes `event` as a VCALENDAR: the master VEVENT followed by one VEVENT
/// per override.
pub fn to_ics(event: &Event, uid: &str) -> String {
    let mut cal = Calendar::new();
    let mut ics_event = icalendar::Event::new();
    ics_event.uid(uid);
    ics_event.summary(&event.title);
    ics_event.add_property("DTSTAMP", Utc::now().format("%Y%m%dT%H%M%SZ").to_string());

    ics_event.append_property(time_property("DTSTART", &event.start));
    ics_event.append_property(time_property("DTEND", &event.end));

    if let Some(ref description) = event.description {
        ics_event.description(description);
    }
    if let Some(ref location) = event.location {
        ics_event.location(location);
    }
    if let Some(ref rrule) = event.recurrence {
        ics_event.add_property("RRULE", rrule);
        for exdate in &event.exdates {
            ics_event.append_multi_property(time_property("EXDATE", exdate));
        }
        for rdate in &event.rdates {
            ics_event.append_multi_property(time_property("RDATE", rdate));
        }
    }
    add_alarms(&mut ics_event, uid, &event.title, &event.alarms);
    cal.push(ics_event.done());

    if event.recurrence.is_some() {
        for instance in &event.overrides {
            cal.push(override_component(event, uid, instance));
        }
    }
    cal.done().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const RECURRING: &str = "BEGIN:VCALENDAR\r\n\
        VERSION:2.0\r\n\
        PRODID:-//Test//Test//EN\r\n\
        BEGIN:VEVENT\r\n\
        UID:standup@example.com\r\n\
        DTSTART:20250303T090000Z\r\n\
        DTEND:20250303T091500Z\r\n\
        SUMMARY:Standup\r\n\
        LOCATION:Room 4\r\n\
        RRULE:FREQ=DAILY;COUNT=5\r\n\
        BEGIN:VALARM\r\n\
        ACTION:DISPLAY\r\n\
        DESCRIPTION:Standup\r\n\
        TRIGGER:-PT10M\r\n\
        END:VALARM\r\n\
        BEGIN:VALARM\r\n\
        ACTION:DISPLAY\r\n\
        DESCRIPTION:Standup\r\n\
        TRIGGER;RELATED=START:-P1DT1H\r\n\
        END:VALARM\r\n\
        END:VEVENT\r\n\
        BEGIN:VEVENT\r\n\
        UID:standup@example.com\r\n\
        RECURRENCE-ID:20250304T090000Z\r\n\
        DTSTART:20250304T100000Z\r\n\
        DTEND:20250304T101500Z\r\n\
        SUMMARY:Standup (moved)\r\n\
        BEGIN:VALARM\r\n\
        ACTION:DISPLAY\r\n\
        TRIGGER:-PT30M\r\n\
        END:VALARM\r\n\
        END:VEVENT\r\n\
        END:VCALENDAR\r\n";

    #[test]
    fn parses_master_event() {
        let parsed = parse_event(RECURRING, "work:/cal/standup.ics", "work:/cal/").unwrap();
        assert_eq!(parsed.uid, "standup@example.com");
        let event = parsed.event;
        assert_eq!(event.id, "work:/cal/standup.ics");
        assert_eq!(event.title, "Standup");
        assert_eq!(event.location.as_deref(), Some("Room 4"));
        assert_eq!(event.recurrence.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert_eq!(event.alarms, vec![10, 25 * 60]);
        assert_eq!(
            event.start,
            EventTime::from_utc(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn overrides_are_read_from_sibling_vevents() {
        let event = parse_event(RECURRING, "e", "c").unwrap().event;
        let at = |h, m| EventTime::from_utc(Utc.with_ymd_and_hms(2025, 3, 4, h, m, 0).unwrap());
        assert_eq!(
            event.overrides,
            vec![EventOverride {
                recurrence_id: at(9, 0),
                start: at(10, 0),
                end: at(10, 15),
                title: Some("Standup (moved)".to_string()),
                alarms: vec![30],
                cancelled: false,
            }]
        );
    }

    #[test]
    fn excluded_dates_are_not_expanded() {
        let ics = "BEGIN:VCALENDAR\r\n\
            VERSION:2.0\r\n\
            BEGIN:VEVENT\r\n\
            UID:daily\r\n\
            DTSTART:20250303T090000Z\r\n\
            DTEND:20250303T093000Z\r\n\
            SUMMARY:Daily\r\n\
            RRULE:FREQ=DAILY;COUNT=3\r\n\
            EXDATE:20250304T090000Z\r\n\
            END:VEVENT\r\n\
            END:VCALENDAR\r\n";
        let event = parse_event(ics, "d", "c").unwrap().event;
        assert_eq!(
            event.exdates,
            vec![EventTime::from_utc(Utc.with_ymd_and_hms(2025, 3, 4, 9, 0, 0).unwrap())]
        );

        let window = calbridge_core::TimeWindow::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
        );
        let starts: Vec<String> = crate::expand_occurrences(&event, window, 10)
            .unwrap()
            .iter()
            .map(|occ| occ.start.to_rfc3339())
            .collect();
        assert_eq!(starts, vec!["2025-03-03T09:00:00+00:00", "2025-03-05T09:00:00+00:00"]);
    }

    #[test]
    fn cancelled_instance_and_folded_alarm() {
        let ics = "BEGIN:VCALENDAR\r\n\
            VERSION:2.0\r\n\
            BEGIN:VEVENT\r\n\
            UID:weekly\r\n\
            DTSTART:20250303T090000Z\r\n\
            DTEND:20250303T100000Z\r\n\
            SUMMARY:Weekly\r\n\
            RRULE:FREQ=WEEKLY\r\n\
            RDATE:20250305T090000Z,20250306T090000Z\r\n\
            BEGIN:VALARM\r\n\
            ACTION:DISPLAY\r\n\
            TRIGGER:-P\r\n \
            T45M\r\n\
            END:VALARM\r\n\
            END:VEVENT\r\n\
            BEGIN:VEVENT\r\n\
            UID:weekly\r\n\
            RECURRENCE-ID:20250310T090000Z\r\n\
            STATUS:CANCELLED\r\n\
            SUMMARY:Weekly\r\n\
            END:VEVENT\r\n\
            END:VCALENDAR\r\n";
        let event = parse_event(ics, "w", "c").unwrap().event;
        assert_eq!(event.alarms, vec![45]);
        assert_eq!(event.rdates.len(), 2);
        assert_eq!(event.overrides.len(), 1);
        let instance = &event.overrides[0];
        assert!(instance.cancelled);
        assert_eq!(instance.title, None);
        assert_eq!(
            instance.end.to_utc(),
            Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn all_day_without_end_spans_one_day() {
        let ics = "BEGIN:VCALENDAR\r\n\
            VERSION:2.0\r\n\
            BEGIN:VEVENT\r\n\
            UID:holiday\r\n\
            DTSTART;VALUE=DATE:20250210\r\n\
            SUMMARY:Holiday\r\n\
            END:VEVENT\r\n\
            END:VCALENDAR\r\n";
        let event = parse_event(ics, "h", "c").unwrap().event;
        let day = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        assert_eq!(event.start, EventTime::from_date(day));
        assert_eq!(event.end, EventTime::from_date(day.succ_opt().unwrap()));
    }

    #[test]
    fn missing_vevent_is_invalid_server_data() {
        let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nEND:VCALENDAR\r\n";
        let err = parse_event(ics, "x", "c").unwrap_err();
        assert_eq!(err.code(), crate::ProviderErrorCode::InvalidServer);
    }

    #[test]
    fn trigger_durations() {
        assert_eq!(trigger_minutes("-PT15M"), Some(15));
        assert_eq!(trigger_minutes("-PT2H"), Some(120));
        assert_eq!(trigger_minutes("-P1W"), Some(7 * 24 * 60));
        assert_eq!(trigger_minutes("PT5M"), Some(-5));
        assert_eq!(trigger_minutes("+PT0S"), Some(0));
        assert_eq!(trigger_minutes("19980101T050000Z"), None);
    }

    #[test]
    fn generated_ics_parses_back() {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        let mut event = Event::new(
            "local:evt-1",
            "local-first",
            "Review",
            EventTime::from_utc(start),
            EventTime::from_utc(start + Duration::minutes(45)),
        )
        .with_recurrence("FREQ=WEEKLY;COUNT=4")
        .with_alarm(15);
        event.description = Some("Quarterly numbers".to_string());

        let ics = to_ics(&event, "evt-1@calbridge");
        assert!(ics.contains("UID:evt-1@calbridge"));
        assert_eq!(ical_uid(&ics).as_deref(), Some("evt-1@calbridge"));

        let parsed = parse_event(&ics, "local:evt-1", "local-first").unwrap().event;
        assert_eq!(parsed.title, "Review");
        assert_eq!(parsed.description.as_deref(), Some("Quarterly numbers"));
        assert_eq!(parsed.recurrence.as_deref(), Some("FREQ=WEEKLY;COUNT=4"));
        assert_eq!(parsed.alarms, vec![15]);
        assert_eq!(parsed.start, event.start);
        assert_eq!(parsed.end, event.end);
    }

    #[test]
    fn exceptions_survive_encoding() {
        let at = |d, h| EventTime::from_utc(Utc.with_ymd_and_hms(2025, 3, d, h, 0, 0).unwrap());
        let mut moved = EventOverride::moved(at(5, 9), at(5, 15), at(5, 16));
        moved.title = Some("Standup (afternoon)".to_string());
        let event = Event::new("e", "c", "Standup", at(3, 9), at(3, 10))
            .with_recurrence("FREQ=DAILY;COUNT=5")
            .with_exdate(at(4, 9))
            .with_exdate(at(6, 9))
            .with_override(moved.clone());

        let ics = to_ics(&event, "standup");
        let parsed = parse_event(&ics, "e", "c").unwrap().event;
        assert_eq!(parsed.exdates, vec![at(4, 9), at(6, 9)]);
        assert_eq!(parsed.overrides, vec![moved]);
        assert_eq!(ical_uid(&ics).as_deref(), Some("standup"));
    }

    #[test]
    fn all_day_dates_are_written_as_dates() {
        let day = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        let event = Event::new(
            "e",
            "c",
            "Holiday",
            EventTime::from_date(day),
            EventTime::from_date(day.succ_opt().unwrap()),
        );
        let ics = to_ics(&event, "e");
        assert!(ics.contains("DTSTART;VALUE=DATE:20250210"));
    }
}
