//! Turn iCalendar text into [`Event`]s.
//!
//! The grammar is handled by the `ical` crate, recurrence rules are expanded with `rrule`.

use std::{
    collections::HashSet,
    io::{BufReader, Cursor},
};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use ical::{parser::ical::component::IcalEvent, property::Property, IcalParser};
use rrule::RRuleSet;
use tracing::{debug, warn};

use crate::{time_zone::ZoneResolver, Error, Event, Result};

static DATE_FORMAT: &str = "%Y%m%d";
static DATE_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Upper bound of occurrences a single recurrence rule may produce inside a window.
const MAX_OCCURRENCES: u16 = 500;

/// The span of time events are collected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Window { start, end }
    }

    /// The window from `now` until `now + lookahead`, capped at the latest representable time.
    pub fn from_now(now: DateTime<Utc>, lookahead: Duration) -> Self {
        let end = now
            .checked_add_signed(lookahead)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Window::new(now, end)
    }

    /// Whether an event from `start` to `end` touches the window.
    fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        end >= self.start && start <= self.end
    }
}

/// Parse all events of `ics` which overlap `window`, sorted by start.
///
/// Floating times and all-day dates are interpreted in `time_zone`, an empty name meaning UTC.
pub fn parse(
    ics: &str,
    time_zone: &str,
    window: &Window,
    resolver: &ZoneResolver,
) -> Result<Vec<Event>> {
    let default_tz = resolver.resolve(time_zone)?;
    let parser = IcalParser::new(BufReader::new(Cursor::new(ics)));
    let mut components: Vec<Component> = vec![];
    for ical_calendar_result in parser {
        let ical_calendar = ical_calendar_result.map_err(|err| Error::parse(err.to_string()))?;
        for ical_event in &ical_calendar.events {
            if let Some(component) = Component::from_ical(ical_event, default_tz, resolver)? {
                components.push(component);
            }
        }
    }
    let overridden: HashSet<(String, DateTime<Utc>)> = components
        .iter()
        .filter_map(|component| Some((component.uid.clone()?, component.recurrence_id?)))
        .collect();
    let mut events: Vec<Event> = vec![];
    for component in &components {
        events.extend(component.occurrences(window, &overridden)?);
    }
    events.sort_by_key(|event| (event.start, event.end));
    debug!(
        components = components.len(),
        events = events.len(),
        "parsed calendar"
    );
    Ok(events)
}

/// A point in time as written in the calendar.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IcsTime {
    at: DateTime<Tz>,
    all_day: bool,
}

/// The parts of a `VEVENT` needed to produce events.
#[derive(Debug)]
struct Component {
    uid: Option<String>,
    summary: String,
    location: Option<String>,
    start: IcsTime,
    length: Duration,
    rrule: Option<String>,
    rdates: Vec<DateTime<Utc>>,
    exdates: Vec<DateTime<Utc>>,
    recurrence_id: Option<DateTime<Utc>>,
}

trait GetIcalProperty {
    fn get_ical_property(&self, name: &str) -> Option<&Property>;

    fn get_ical_property_value(&self, name: &str) -> Option<&String> {
        self.get_ical_property(name)
            .and_then(|property| property.value.as_ref())
    }
}

impl GetIcalProperty for IcalEvent {
    fn get_ical_property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|property| property.name.eq_ignore_ascii_case(name))
    }
}

impl Component {
    /// Read a `VEVENT`, events without a start are skipped.
    fn from_ical(
        ical_event: &IcalEvent,
        default_tz: Tz,
        resolver: &ZoneResolver,
    ) -> Result<Option<Self>> {
        let Some(dt_start) = ical_event.get_ical_property("DTSTART") else {
            debug!(
                uid = ?ical_event.get_ical_property_value("UID"),
                "skipping event without DTSTART"
            );
            return Ok(None);
        };
        let start = parse_time(dt_start, default_tz, resolver)?;
        let length = match (
            ical_event.get_ical_property("DTEND"),
            ical_event.get_ical_property_value("DURATION"),
        ) {
            (Some(dt_end), _) => parse_time(dt_end, default_tz, resolver)?.at - start.at,
            (None, Some(duration)) => parse_duration(duration)?,
            (None, None) if start.all_day => Duration::days(1),
            (None, None) => Duration::zero(),
        };
        if start.at.checked_add_signed(length).is_none() {
            return Err(Error::parse("DURATION out of range"));
        }
        let times_of = |name: &str| -> Result<Vec<DateTime<Utc>>> {
            let mut times = vec![];
            for property in ical_event
                .properties
                .iter()
                .filter(|property| property.name.eq_ignore_ascii_case(name))
            {
                for time in parse_time_list(property, default_tz, resolver)? {
                    times.push(time.at.with_timezone(&Utc));
                }
            }
            Ok(times)
        };
        let recurrence_id = ical_event
            .get_ical_property("RECURRENCE-ID")
            .map(|property| parse_time(property, default_tz, resolver))
            .transpose()?
            .map(|time| time.at.with_timezone(&Utc));
        Ok(Some(Component {
            uid: ical_event.get_ical_property_value("UID").cloned(),
            summary: ical_event
                .get_ical_property_value("SUMMARY")
                .map(|summary| unescape(summary))
                .unwrap_or_default(),
            location: ical_event
                .get_ical_property_value("LOCATION")
                .map(|location| unescape(location))
                .filter(|location| !location.trim().is_empty()),
            start,
            length,
            rrule: ical_event.get_ical_property_value("RRULE").cloned(),
            rdates: times_of("RDATE")?,
            exdates: times_of("EXDATE")?,
            recurrence_id,
        }))
    }

    /// All occurrences of this component inside `window`.
    ///
    /// Occurrences replaced by a `RECURRENCE-ID` component of the same UID are left out.
    fn occurrences(
        &self,
        window: &Window,
        overridden: &HashSet<(String, DateTime<Utc>)>,
    ) -> Result<Vec<Event>> {
        let mut starts = match &self.rrule {
            Some(rule) => self.expand(rule, window).unwrap_or_else(|err| {
                warn!(uid = ?self.uid, %rule, %err, "ignoring recurrence rule");
                vec![self.start.at.with_timezone(&Utc)]
            }),
            None => vec![self.start.at.with_timezone(&Utc)],
        };
        starts.extend(self.rdates.iter().copied());
        starts.sort();
        starts.dedup();
        let mut events = vec![];
        for start in starts
            .into_iter()
            .filter(|start| !self.exdates.contains(start))
            .filter(|start| match (&self.uid, self.recurrence_id) {
                (Some(uid), None) => !overridden.contains(&(uid.clone(), *start)),
                _ => true,
            })
        {
            let end = start
                .checked_add_signed(self.length)
                .ok_or_else(|| Error::parse("DURATION out of range"))?;
            if window.overlaps(start, end) {
                events.push(Event {
                    name: self.summary.clone(),
                    start,
                    end,
                    location: self.location.clone(),
                });
            }
        }
        Ok(events)
    }

    /// Expand the recurrence rule into the starts of occurrences touching `window`.
    ///
    /// A date or floating `UNTIL` is read in the zone of the start and passed on in UTC.
    fn expand(
        &self,
        rule: &str,
        window: &Window,
    ) -> std::result::Result<Vec<DateTime<Utc>>, rrule::RRuleError> {
        let dt_start = match self.start.at.timezone() {
            Tz::UTC => format!(
                "DTSTART:{}Z",
                self.start.at.naive_utc().format(DATE_TIME_FORMAT)
            ),
            tz => format!(
                "DTSTART;TZID={}:{}",
                tz.name(),
                self.start.at.naive_local().format(DATE_TIME_FORMAT)
            ),
        };
        let rule = until_as_utc(rule, self.start.at.timezone());
        let rrule_set: RRuleSet = format!("{dt_start}\nRRULE:{rule}").parse()?;
        let tz: rrule::Tz = Utc.into();
        let after = window
            .start
            .checked_sub_signed(self.length)
            .and_then(|after| after.checked_sub_signed(Duration::seconds(1)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .with_timezone(&tz);
        let before = window
            .end
            .checked_add_signed(Duration::seconds(1))
            .unwrap_or(window.end)
            .with_timezone(&tz);
        let result = rrule_set.after(after).before(before).all(MAX_OCCURRENCES);
        Ok(result
            .dates
            .iter()
            .map(|date| date.with_timezone(&Utc))
            .collect())
    }
}

/// Rewrite a date or floating `UNTIL` of `rule` into a UTC time, reading it in `tz`.
///
/// A date covers the whole local day. Values that do not parse are kept for `rrule` to reject.
fn until_as_utc(rule: &str, tz: Tz) -> String {
    rule.split(';')
        .map(|part| {
            let Some((key, value)) = part.split_once('=') else {
                return part.to_string();
            };
            if !key.trim().eq_ignore_ascii_case("UNTIL") || value.to_ascii_uppercase().ends_with('Z') {
                return part.to_string();
            }
            let local = match value.len() {
                8 => NaiveDate::parse_from_str(value, DATE_FORMAT)
                    .ok()
                    .and_then(|date| date.and_hms_opt(23, 59, 59)),
                _ => NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT).ok(),
            };
            match local.and_then(|local| localize(tz, local)) {
                Some(until) => format!("{key}={}Z", until.naive_utc().format(DATE_TIME_FORMAT)),
                None => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Get a parameter of a property, ignoring surrounding quotes.
fn get_param<'a>(property: &'a Property, name: &str) -> Option<&'a str> {
    property
        .params
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(|value| value.trim_matches('"'))
}

fn parse_time(property: &Property, default_tz: Tz, resolver: &ZoneResolver) -> Result<IcsTime> {
    let value = property
        .value
        .as_deref()
        .ok_or_else(|| Error::parse(format!("{} has no value", property.name)))?;
    parse_time_value(value, property, default_tz, resolver)
}

/// Parse a comma separated `RDATE` or `EXDATE` list, periods count with their start.
fn parse_time_list(
    property: &Property,
    default_tz: Tz,
    resolver: &ZoneResolver,
) -> Result<Vec<IcsTime>> {
    let Some(value) = property.value.as_deref() else {
        return Ok(vec![]);
    };
    value
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(|item| {
            let start = item.split('/').next().unwrap_or(item);
            parse_time_value(start, property, default_tz, resolver)
        })
        .collect()
}

fn parse_time_value(
    value: &str,
    property: &Property,
    default_tz: Tz,
    resolver: &ZoneResolver,
) -> Result<IcsTime> {
    let value = value.trim();
    let invalid = || Error::parse(format!("invalid {} value {value:?}", property.name));
    let is_date = get_param(property, "VALUE").is_some_and(|kind| kind.eq_ignore_ascii_case("DATE"))
        || value.len() == 8;
    if is_date {
        let date = NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| invalid())?;
        let at = localize(default_tz, date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
        return Ok(IcsTime { at, all_day: true });
    }
    if let Some(utc) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(utc, DATE_TIME_FORMAT).map_err(|_| invalid())?;
        return Ok(IcsTime {
            at: Tz::UTC.from_utc_datetime(&naive),
            all_day: false,
        });
    }
    let naive = NaiveDateTime::parse_from_str(value, DATE_TIME_FORMAT).map_err(|_| invalid())?;
    let tz = match get_param(property, "TZID") {
        Some(tzid) => resolver.resolve(tzid)?,
        None => default_tz,
    };
    let at = localize(tz, naive).ok_or_else(invalid)?;
    Ok(IcsTime { at, all_day: false })
}

/// Place a wall clock time into a zone, times skipped by a DST gap move forward by an hour.
fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// Parse an ISO 8601 duration like `PT1H30M`, a leading sign is accepted.
fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let (negative, unsigned) = match value.strip_prefix('-') {
        Some(unsigned) => (true, unsigned),
        None => (false, value.trim_start_matches('+')),
    };
    let invalid = || Error::parse(format!("invalid DURATION value {value:?}"));
    let duration = iso8601::duration(unsigned).map_err(|_| invalid())?;
    let std_duration: std::time::Duration = duration.into();
    let duration = Duration::from_std(std_duration).map_err(|_| invalid())?;
    Ok(if negative { -duration } else { duration })
}

/// Undo iCalendar text escaping.
fn unescape(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => unescaped.push('\n'),
            Some(escaped) => unescaped.push(escaped),
            None => unescaped.push('\\'),
        }
    }
    unescaped
}
