//! This crate finds the next upcoming event of an iCalendar feed.
//!
//! The feed is downloaded from a caller supplied URL, parsed into [`Event`]s within a time window
//! and the earliest event which has not started yet is returned together with its reminder flags.

pub use chrono;
pub use chrono_tz;
pub use reqwest;

pub mod calendar_client;
pub mod error;
pub mod event;
pub mod parser;
pub mod selector;
pub mod time_zone;

pub use error::{Error, Result};
pub use event::{Event, NextEvent, ReminderFlags};
