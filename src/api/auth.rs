//! Authentication for non-loopback clients.
//!
//! Loopback requests pass through. Everyone else needs `Authorization: Bearer <token>`
//! matching `server.auth_token`, or the session cookie issued by `POST /api/auth/login`.
//! The cookie is `<expiry>.<mac>` where the MAC is a keyed blake3 hash of the expiry under a
//! key derived from the token.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{peer_addr, AppState};

pub const SESSION_COOKIE: &str = "hindsight_session";
const COOKIE_TTL_SECS: i64 = 24 * 60 * 60;
const KEY_CONTEXT: &str = "hindsight 2025 session cookie";

/// Paths reachable without credentials.
const EXEMPT: &[&str] = &["/health", "/login", "/api/auth/login"];

#[derive(Clone)]
pub struct AuthConfig {
    token: Option<Vec<u8>>,
    cookie_key: [u8; 32],
}

impl AuthConfig {
    pub fn new(token: Option<&str>) -> Self {
        let token = token.filter(|t| !t.is_empty());
        Self {
            cookie_key: blake3::derive_key(KEY_CONTEXT, token.unwrap_or_default().as_bytes()),
            token: token.map(|t| t.as_bytes().to_vec()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Constant-time comparison against the configured token.
    pub fn verify_token(&self, provided: &str) -> bool {
        let Some(expected) = &self.token else {
            return false;
        };
        let provided = provided.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        expected.iter().zip(provided).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }

    pub fn issue_cookie(&self, now_secs: i64) -> String {
        let expiry = now_secs + COOKIE_TTL_SECS;
        let mac = blake3::keyed_hash(&self.cookie_key, expiry.to_string().as_bytes());
        format!("{expiry}.{}", mac.to_hex())
    }

    pub fn verify_cookie(&self, value: &str, now_secs: i64) -> bool {
        if !self.is_configured() {
            return false;
        }
        let Some((expiry, mac)) = value.split_once('.') else {
            return false;
        };
        let Ok(expiry_secs) = expiry.parse::<i64>() else {
            return false;
        };
        if expiry_secs <= now_secs {
            return false;
        }
        let Ok(provided) = blake3::Hash::from_hex(mac) else {
            return false;
        };
        // `Hash` equality is constant-time.
        provided == blake3::keyed_hash(&self.cookie_key, expiry.as_bytes())
    }
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

/// Browsers get redirected to the login page; API clients get a 401.
fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html") && !accept.contains("application/json"))
}

pub fn is_authorized(auth: &AuthConfig, headers: &HeaderMap) -> bool {
    let now = chrono::Utc::now().timestamp();
    bearer_token(headers).is_some_and(|t| auth.verify_token(t))
        || session_cookie(headers).is_some_and(|c| auth.verify_cookie(c, now))
}

pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if EXEMPT.contains(&request.uri().path()) {
        return next.run(request).await;
    }
    if peer_addr(&request).is_some_and(|addr| addr.ip().is_loopback()) {
        return next.run(request).await;
    }
    if is_authorized(&state.auth, request.headers()) {
        return next.run(request).await;
    }

    tracing::warn!(
        path = %request.uri().path(),
        peer = ?peer_addr(&request),
        "unauthenticated request rejected"
    );
    if wants_html(request.headers()) {
        return Redirect::to("/login").into_response();
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "authentication required", "code": 401 })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct LoginRequest {
    token: String,
}

pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    if !state.auth.verify_token(&body.token) {
        tracing::warn!("login with invalid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token", "code": 401 })),
        )
            .into_response();
    }
    let cookie = state.auth.issue_cookie(chrono::Utc::now().timestamp());
    let set_cookie = format!(
        "{SESSION_COOKIE}={cookie}; Path=/; HttpOnly; SameSite=Strict; Max-Age={COOKIE_TTL_SECS}"
    );
    let mut response = Json(json!({ "ok": true })).into_response();
    if let Ok(value) = HeaderValue::from_str(&set_cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

pub async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

const LOGIN_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>hindsight login</title></head>
<body>
<form id="login">
  <label>Token <input type="password" name="token" autofocus></label>
  <button type="submit">Sign in</button>
  <p id="msg"></p>
</form>
<script>
document.getElementById('login').addEventListener('submit', async (e) => {
  e.preventDefault();
  const token = e.target.token.value;
  const res = await fetch('/api/auth/login', {
    method: 'POST',
    headers: {'Content-Type': 'application/json'},
    body: JSON.stringify({token}),
  });
  if (res.ok) { window.location = '/api/health'; }
  else { document.getElementById('msg').textContent = 'Invalid token'; }
});
</script>
</body>
</html>
"#;
