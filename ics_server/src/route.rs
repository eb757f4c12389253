pub mod next_event;
pub mod root;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use ics_core::reqwest::Client;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::{config::AppConfig, rate_limit, rate_limit::RateLimiter};

/// Shared by all requests.
#[derive(Debug, Clone)]
pub struct AppState {
    pub client: Client,
    /// always holds the latest loaded configuration
    pub config: watch::Receiver<Arc<AppConfig>>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: watch::Receiver<Arc<AppConfig>>) -> Self {
        AppState {
            client: Client::new(),
            config,
            limiter: RateLimiter::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root::handler))
        .route("/ics/next-event", post(next_event::handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::PathBuf, sync::Arc};

    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{header::CONTENT_TYPE, Request, StatusCode},
        response::Response,
        routing::get,
        Router,
    };
    use ics_core::chrono::{Duration, Utc};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::{
        config::{AppConfig, ConfigLoader, Settings, SCHEMA},
        route::{next_event::NextEventResponse, router, AppState},
    };

    fn test_config() -> AppConfig {
        let settings = Settings {
            environment: Some("test".to_string()),
            env_prefix: Some("ICS_SRV_TEST_ROUTE".to_string()),
            debug: false,
        };
        ConfigLoader::new(settings, SCHEMA, vec![PathBuf::from("does-not-exist.yml")])
            .load()
            .unwrap()
    }

    fn test_router() -> Router {
        let (_, receiver) = watch::channel(Arc::new(test_config()));
        router(AppState::new(receiver))
    }

    /// Serve `ics` on a local port and return its URL.
    fn serve_calendar(ics: String) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/calendar.ics",
            get(move || {
                let ics = ics.clone();
                async move { ics }
            }),
        );
        tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));
        format!("http://{addr}/calendar.ics")
    }

    fn calendar(events: &[(&str, i64)]) -> String {
        let format = "%Y%m%dT%H%M%SZ";
        let events: String = events
            .iter()
            .map(|(name, minutes)| {
                let start = Utc::now() + Duration::minutes(*minutes);
                let end = start + Duration::minutes(30);
                format!(
                    "BEGIN:VEVENT\r\nUID:{minutes}@example.com\r\nDTSTART:{}\r\nDTEND:{}\r\nSUMMARY:{name}\r\nLOCATION:Room {minutes}\r\nEND:VEVENT\r\n",
                    start.format(format),
                    end.format(format)
                )
            })
            .collect();
        format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n{events}END:VCALENDAR\r\n")
    }

    fn next_event_request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ics/next-event")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_root() {
        let response = test_router()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Welcome to the Tidbyt ICS Server!");
    }

    #[tokio::test]
    async fn test_next_event() {
        let url = serve_calendar(calendar(&[("Later", 300), ("Running", -5), ("Soon", 9)]));
        let response = test_router()
            .oneshot(next_event_request(format!(
                r#"{{"icsUrl": "{url}", "tz": "Europe/Berlin"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let next_event: NextEventResponse =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(next_event.event_name, "Soon");
        assert_eq!(next_event.event_location.as_deref(), Some("Room 9"));
        assert_eq!(next_event.event_end - next_event.event_start, 30 * 60);
        assert!(next_event.ten_minute_warning);
        assert!(!next_event.in_progress);
    }

    #[tokio::test]
    async fn test_next_event_without_tz() {
        let url = serve_calendar(calendar(&[("Tomorrow", 24 * 60)]));
        let response = test_router()
            .oneshot(next_event_request(format!(r#"{{"icsUrl": "{url}"}}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_next_event_unreachable() {
        let response = test_router()
            .oneshot(next_event_request(
                r#"{"icsUrl": "http://127.0.0.1:1/calendar.ics", "tz": ""}"#.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.starts_with("failed to fetch calendar"));
    }

    #[tokio::test]
    async fn test_next_event_unknown_zone() {
        let url = serve_calendar(calendar(&[("Soon", 9)]));
        let response = test_router()
            .oneshot(next_event_request(format!(
                r#"{{"icsUrl": "{url}", "tz": "Mars/Olympus_Mons"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_next_event_none_upcoming() {
        let url = serve_calendar(calendar(&[]));
        let response = test_router()
            .oneshot(next_event_request(format!(r#"{{"icsUrl": "{url}"}}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "No upcoming events");
    }

    #[tokio::test]
    async fn test_next_event_malformed_body() {
        let response = test_router()
            .oneshot(next_event_request(r#"{"url": 1}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let router = test_router();
        let request = |forwarded_for: &str| {
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", forwarded_for)
                .body(Body::empty())
                .unwrap()
        };
        for _ in 0..20 {
            let response = router.clone().oneshot(request("203.0.113.7")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = router.clone().oneshot(request("203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(response).await, r#"{"error":"Too many requests"}"#);
        let response = router.clone().oneshot(request("198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_skips_loopback() {
        let router = test_router();
        for _ in 0..30 {
            let mut request = Request::builder()
                .uri("/")
                .header("x-forwarded-for", "203.0.113.8")
                .body(Body::empty())
                .unwrap();
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000))));
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
