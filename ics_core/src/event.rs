use chrono::{DateTime, Duration, Utc};

/// A single (possibly expanded) calendar event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub location: Option<String>,
}

/// Reminder flags of an event relative to some point in time.
///
/// The warning windows do not overlap:
/// ten minutes covers `[start - 10min, start - 5min)`,
/// five minutes covers `[start - 5min, start - 1min)`,
/// one minute covers `[start - 1min, start)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderFlags {
    pub ten_minute_warning: bool,
    pub five_minute_warning: bool,
    pub one_minute_warning: bool,
    pub in_progress: bool,
}

impl ReminderFlags {
    /// Compute the flags of an event starting at `start` as seen at `now`.
    pub fn at(start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let within = |from: Duration, to: Duration| now >= start - from && now < start - to;
        ReminderFlags {
            ten_minute_warning: within(Duration::minutes(10), Duration::minutes(5)),
            five_minute_warning: within(Duration::minutes(5), Duration::minutes(1)),
            one_minute_warning: within(Duration::minutes(1), Duration::zero()),
            in_progress: now >= start,
        }
    }
}

/// The event chosen as "next" together with its reminder flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextEvent {
    pub event: Event,
    pub flags: ReminderFlags,
}

impl NextEvent {
    pub fn new(event: Event, now: DateTime<Utc>) -> Self {
        let flags = ReminderFlags::at(event.start, now);
        NextEvent { event, flags }
    }
}
