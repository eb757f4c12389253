//! Choose the next event out of a parsed calendar.

use chrono::{DateTime, Utc};

use crate::{Event, NextEvent};

/// Select the event with the earliest start which is still in the future.
///
/// The order of `events` does not matter, calendar providers do not agree on sorting.
/// Events starting at the same instant are ordered by their end, remaining ties keep input order.
pub fn select_next(events: &[Event], now: DateTime<Utc>) -> Option<NextEvent> {
    events
        .iter()
        .filter(|event| event.start > now)
        .min_by_key(|event| (event.start, event.end))
        .map(|event| NextEvent::new(event.clone(), now))
}
