use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use ics_core::{
    calendar_client,
    chrono::Utc,
    time_zone::ZoneResolver,
    NextEvent,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::ApiError, route::AppState};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcsRequest {
    pub ics_url: String,
    /// zone for floating times and all-day events, empty means UTC
    #[serde(default)]
    pub tz: String,
}

/// The next event as sent to clients, times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextEventResponse {
    pub event_name: String,
    pub event_start: i64,
    pub event_end: i64,
    pub event_location: Option<String>,
    pub ten_minute_warning: bool,
    pub five_minute_warning: bool,
    pub one_minute_warning: bool,
    pub in_progress: bool,
}

impl From<NextEvent> for NextEventResponse {
    fn from(value: NextEvent) -> Self {
        NextEventResponse {
            event_name: value.event.name,
            event_start: value.event.start.timestamp(),
            event_end: value.event.end.timestamp(),
            event_location: value.event.location,
            ten_minute_warning: value.flags.ten_minute_warning,
            five_minute_warning: value.flags.five_minute_warning,
            one_minute_warning: value.flags.one_minute_warning,
            in_progress: value.flags.in_progress,
        }
    }
}

/// Handle next event requests.
///
/// The `icsUrl` must be given in the JSON body, `tz` is optional.
pub async fn handler(
    State(state): State<AppState>,
    payload: Result<Json<IcsRequest>, JsonRejection>,
) -> Result<Json<NextEventResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    info!(url = %request.ics_url, tz = %request.tz, "next event requested");
    let config = state.config.borrow().clone();
    let next_event = calendar_client::get_next_event(
        &state.client,
        &request.ics_url,
        &request.tz,
        config.lookahead(),
        &ZoneResolver::new(&config.time_zone_aliases),
        Utc::now(),
    )
    .await?;
    Ok(Json(NextEventResponse::from(next_event)))
}

#[cfg(test)]
mod tests {
    use ics_core::{
        chrono::{Duration, TimeZone, Utc},
        Event, NextEvent,
    };

    use crate::route::next_event::NextEventResponse;

    #[test]
    fn test_response_round_trip() {
        let start = Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap();
        let event = Event {
            name: "Design review".to_string(),
            start,
            end: start + Duration::minutes(45),
            location: Some("Room \"Kepler\"".to_string()),
        };
        let next_event = NextEvent::new(event.clone(), start - Duration::minutes(3));
        let response = NextEventResponse::from(next_event);
        let json = serde_json::to_string(&response).unwrap();
        let parsed: NextEventResponse = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, response);
        assert_eq!(parsed.event_name, event.name);
        assert_eq!(Utc.timestamp_opt(parsed.event_start, 0).unwrap(), event.start);
        assert_eq!(Utc.timestamp_opt(parsed.event_end, 0).unwrap(), event.end);
        assert_eq!(parsed.event_location, event.location);
        assert!(parsed.five_minute_warning);
    }

    #[test]
    fn test_response_field_names() {
        let start = Utc.with_ymd_and_hms(2024, 5, 17, 10, 0, 0).unwrap();
        let event = Event {
            name: "Focus time".to_string(),
            start,
            end: start + Duration::hours(2),
            location: None,
        };
        let response = NextEventResponse::from(NextEvent::new(event, start));
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["eventName"], "Focus time");
        assert_eq!(value["eventStart"], 1715940000);
        assert_eq!(value["eventEnd"], 1715947200);
        assert!(value["eventLocation"].is_null());
        assert_eq!(value["inProgress"], true);
        assert_eq!(value["tenMinuteWarning"], false);
    }
}
