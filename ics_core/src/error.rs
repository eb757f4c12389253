use thiserror::Error;

/// Everything that can go wrong while looking up the next event of a calendar.
#[derive(Debug, Error)]
pub enum Error {
    /// The calendar could not be downloaded.
    #[error("failed to fetch calendar: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The calendar text is not valid iCalendar data.
    #[error("failed to parse calendar: {0}")]
    Parse(String),

    /// A zone name could neither be resolved through the alias table nor the IANA database.
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),

    /// No event of the calendar starts in the future.
    #[error("No upcoming events")]
    NoUpcomingEvents,
}

impl Error {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Error::Parse(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
