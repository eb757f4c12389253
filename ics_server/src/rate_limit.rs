//! Fixed window rate limiting keyed by the `x-forwarded-for` header.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::route::AppState;

/// Number of tracked clients above which expired windows are dropped.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Tracks the request count of every client within its current window.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request of `key` and tell whether it is within `max` requests per `expiration`.
    pub fn try_acquire(&self, key: &str, max: u32, expiration: Duration, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, window| now.duration_since(window.started) < expiration);
        }
        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= expiration {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= max {
            return false;
        }
        window.count += 1;
        true
    }
}

/// Middleware rejecting clients over their limit, loopback peers are never limited.
pub async fn limit<B>(
    State(state): State<AppState>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if peer.is_some_and(|ip| ip.is_loopback()) {
        return next.run(request).await;
    }
    let key = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_default();
    let (max, expiration) = {
        let config = state.config.borrow();
        (
            config.rate_limit.max,
            Duration::from_secs(config.rate_limit.expiration_secs),
        )
    };
    if !state.limiter.try_acquire(&key, max, expiration, Instant::now()) {
        warn!(key, "rate limit reached");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too many requests" })),
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::rate_limit::RateLimiter;

    #[test]
    fn test_limit_per_key() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let expiration = Duration::from_secs(30);
        for _ in 0..20 {
            assert!(limiter.try_acquire("10.0.0.1", 20, expiration, now));
        }
        assert!(!limiter.try_acquire("10.0.0.1", 20, expiration, now));
        assert!(limiter.try_acquire("10.0.0.2", 20, expiration, now));
    }

    #[test]
    fn test_window_expires() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let expiration = Duration::from_secs(30);
        assert!(limiter.try_acquire("", 1, expiration, now));
        assert!(!limiter.try_acquire("", 1, expiration, now + Duration::from_secs(29)));
        assert!(limiter.try_acquire("", 1, expiration, now + Duration::from_secs(30)));
        assert!(!limiter.try_acquire("", 1, expiration, now + Duration::from_secs(31)));
    }

    #[test]
    fn test_expired_windows_are_pruned() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let expiration = Duration::from_secs(1);
        for client in 0..=super::PRUNE_THRESHOLD {
            limiter.try_acquire(&client.to_string(), 1, expiration, now);
        }
        limiter.try_acquire("late", 1, expiration, now + Duration::from_secs(2));
        assert_eq!(limiter.windows.lock().unwrap().len(), 1);
    }
}
