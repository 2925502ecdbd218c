//! Sliding-window rate limiting keyed by bearer-token prefix or client IP.
//!
//! Loopback clients are never limited.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::auth::{bearer_token, AuthConfig};
use super::{peer_addr, AppState};
use crate::config::RateLimitSettings;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Characters of the bearer token used as the limiter key.
const TOKEN_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { limit: u32, remaining: u32, reset_secs: u64 },
    Limited { limit: u32, retry_after_secs: u64 },
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    entries: Mutex<HashMap<String, Vec<Instant>>>,
    last_cleanup: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            entries: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.max_requests, Duration::from_secs(settings.window_secs))
    }

    /// Record a request for `key` if it fits in the window.
    pub fn check(&self, key: &str) -> Decision {
        self.maybe_cleanup();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let hits = entries.entry(key.to_string()).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);

        let reset_after = |oldest: Option<&Instant>| {
            oldest
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window)
                .as_secs()
                .max(1)
        };

        if hits.len() >= self.max_requests as usize {
            return Decision::Limited {
                limit: self.max_requests,
                retry_after_secs: reset_after(hits.first()),
            };
        }
        hits.push(now);
        Decision::Allowed {
            limit: self.max_requests,
            remaining: self.max_requests - hits.len() as u32,
            reset_secs: reset_after(hits.first()),
        }
    }

    fn maybe_cleanup(&self) {
        let mut last = self.last_cleanup.lock();
        if last.elapsed() < CLEANUP_INTERVAL {
            return;
        }
        let window = self.window;
        self.entries
            .lock()
            .retain(|_, hits| hits.last().is_some_and(|t| t.elapsed() < window));
        *last = Instant::now();
    }
}

/// Limiter key: the bearer token's prefix when the token is valid, else the client IP.
///
/// Unverified tokens never get their own bucket.
pub fn limiter_key(
    auth: &AuthConfig,
    headers: &HeaderMap,
    ip: Option<std::net::IpAddr>,
) -> String {
    let token = bearer_token(headers).filter(|t| auth.verify_token(t));
    match (token, ip) {
        (Some(t), _) => {
            let prefix: String = t.chars().take(TOKEN_PREFIX_LEN).collect();
            format!("token:{prefix}")
        }
        (None, Some(ip)) => format!("ip:{ip}"),
        (None, None) => "ip:unknown".to_string(),
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.config.server.rate_limit.enabled {
        return next.run(request).await;
    }
    let peer = peer_addr(&request);
    if peer.is_some_and(|addr| addr.ip().is_loopback()) {
        return next.run(request).await;
    }

    let key = limiter_key(&state.auth, request.headers(), peer.map(|a| a.ip()));
    match state.limiter.check(&key) {
        Decision::Allowed { limit, remaining, reset_secs } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            set_header(headers, "x-ratelimit-limit", limit.into());
            set_header(headers, "x-ratelimit-remaining", remaining.into());
            set_header(headers, "x-ratelimit-reset", reset_secs);
            response
        }
        Decision::Limited { limit, retry_after_secs } => {
            tracing::warn!(key = %key, retry_after_secs, "rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate limit exceeded",
                    "code": 429,
                    "retry_after": retry_after_secs,
                })),
            )
                .into_response();
            let headers = response.headers_mut();
            set_header(headers, "retry-after", retry_after_secs);
            set_header(headers, "x-ratelimit-limit", limit.into());
            set_header(headers, "x-ratelimit-remaining", 0);
            set_header(headers, "x-ratelimit-reset", retry_after_secs);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_allows_exactly_max_requests() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for expected_remaining in [2, 1, 0] {
            match limiter.check("ip:10.0.0.1") {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("unexpected {other:?}"),
            }
        }
        match limiter.check("ip:10.0.0.1") {
            Decision::Limited { retry_after_secs, .. } => assert!(retry_after_secs >= 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(limiter.check("ip:10.0.0.2"), Decision::Allowed { .. }));
    }

    #[test]
    fn expired_hits_free_the_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        assert!(matches!(limiter.check("k"), Decision::Allowed { .. }));
        assert!(matches!(limiter.check("k"), Decision::Limited { .. }));
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(limiter.check("k"), Decision::Allowed { .. }));
    }

    #[test]
    fn only_valid_tokens_get_their_own_key() {
        let auth = AuthConfig::new(Some("abcdefghijkl"));
        let ip = "192.168.1.5".parse().ok();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abcdefghijkl".parse().unwrap());
        assert_eq!(limiter_key(&auth, &headers, ip), "token:abcdefgh");

        headers.insert("authorization", "Bearer made-up-token".parse().unwrap());
        assert_eq!(limiter_key(&auth, &headers, ip), "ip:192.168.1.5");
        assert_eq!(limiter_key(&auth, &HeaderMap::new(), ip), "ip:192.168.1.5");
        assert_eq!(limiter_key(&AuthConfig::new(None), &headers, None), "ip:unknown");
    }
}
