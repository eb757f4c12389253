//! This client fetches calendars and finds their next event.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use tracing::{debug, info};

use crate::{
    parser::{self, Window},
    selector,
    time_zone::ZoneResolver,
    Error, NextEvent, Result,
};

/// Get the next event of the calendar at `url`.
///
/// Events are collected from `now` until `now + lookahead`, floating times are read in `time_zone`.
pub async fn get_next_event(
    client: &Client,
    url: &str,
    time_zone: &str,
    lookahead: Duration,
    resolver: &ZoneResolver,
    now: DateTime<Utc>,
) -> Result<NextEvent> {
    let ics = fetch(client, url).await?;
    let events = parser::parse(&ics, time_zone, &Window::from_now(now, lookahead), resolver)?;
    let next_event = selector::select_next(&events, now).ok_or(Error::NoUpcomingEvents)?;
    info!(
        url,
        events = events.len(),
        name = %next_event.event.name,
        start = %next_event.event.start,
        "found next event"
    );
    Ok(next_event)
}

/// Download the raw iCalendar text.
///
/// Every call hits the network, unsuccessful status codes are errors.
pub async fn fetch(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?.error_for_status()?;
    let ics = response.text().await?;
    debug!(url, bytes = ics.len(), "fetched calendar");
    Ok(ics)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use reqwest::Client;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use crate::{
        calendar_client::{fetch, get_next_event},
        time_zone::ZoneResolver,
        Error,
    };

    /// Serve a single HTTP response on a local port and return the URL pointing at it.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/calendar\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });
        format!("http://{addr}/calendar.ics")
    }

    fn ics_starting_in(minutes: &[i64]) -> String {
        let format = "%Y%m%dT%H%M%SZ";
        let events: String = minutes
            .iter()
            .map(|minutes| {
                let start = Utc::now() + Duration::minutes(*minutes);
                let end = start + Duration::minutes(30);
                format!(
                    "BEGIN:VEVENT\r\nUID:{minutes}@example.com\r\nDTSTART:{}\r\nDTEND:{}\r\nSUMMARY:In {minutes} minutes\r\nEND:VEVENT\r\n",
                    start.format(format),
                    end.format(format)
                )
            })
            .collect();
        format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n{events}END:VCALENDAR\r\n")
    }

    #[tokio::test]
    async fn test_fetch() {
        let url = serve_once("200 OK", "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_string()).await;
        let ics = fetch(&Client::new(), &url).await.unwrap();
        assert_eq!(ics, "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");
    }

    #[tokio::test]
    async fn test_fetch_unreachable() {
        let error = fetch(&Client::new(), "http://127.0.0.1:1/calendar.ics")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Fetch(_)));
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let url = serve_once("404 Not Found", String::new()).await;
        let error = fetch(&Client::new(), &url).await.unwrap_err();
        assert!(matches!(error, Error::Fetch(_)));
    }

    #[tokio::test]
    async fn test_get_next_event() {
        let url = serve_once("200 OK", ics_starting_in(&[180, -10, 45, 2000])).await;
        let next_event = get_next_event(
            &Client::new(),
            &url,
            "",
            Duration::days(7),
            &ZoneResolver::default(),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(next_event.event.name, "In 45 minutes");
        assert!(!next_event.flags.in_progress);
    }

    #[tokio::test]
    async fn test_get_next_event_none_upcoming() {
        let url = serve_once("200 OK", ics_starting_in(&[-20])).await;
        let error = get_next_event(
            &Client::new(),
            &url,
            "",
            Duration::days(7),
            &ZoneResolver::default(),
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, Error::NoUpcomingEvents));
    }
}
