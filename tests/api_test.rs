mod helpers;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use hindsight::api::{create_router, AppState};
use hindsight::config::HindsightConfig;
use hindsight::lifecycle::health::HealthMonitor;
use hindsight::lifecycle::process::{read_pid_file, ProcessRegistry};
use hindsight::lifecycle::{ControlHandle, DaemonState, StateHandle, StopReason};
use hindsight::metrics::MetricsService;
use hindsight::server::{self, Worker};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use helpers::{
    observation_xml, plain_store, session_manager, wait_until, worker_config, FakeProvider,
};

const TOKEN: &str = "test-token-123";

// --- real listener ---

async fn spawn_worker(dir: &TempDir, provider: Arc<FakeProvider>) -> (Worker, String) {
    let config = Arc::new(worker_config(dir.path()));
    let store = plain_store();
    let sessions = session_manager(store.clone(), provider, None);
    let worker = server::start_with(config, store, sessions, Arc::new(ProcessRegistry::new(1)))
        .await
        .unwrap();
    let base = format!("http://{}", worker.addr);
    assert!(
        HealthMonitor::new(base.clone(), Duration::from_millis(20))
            .wait_for_health(Duration::from_secs(5))
            .await
    );
    (worker, base)
}

async fn get(url: &str) -> (u16, String) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

async fn post_json(url: &str, body: Value) -> (u16, String) {
    let resp = reqwest::Client::new().post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

fn parse(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn health_version_and_pid_file() {
    let dir = TempDir::new().unwrap();
    let (worker, base) = spawn_worker(&dir, Arc::new(FakeProvider::new(""))).await;

    let (status, body) = get(&format!("{base}/health")).await;
    assert_eq!(status, 200);
    let health = parse(&body);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["state"], "ready");
    assert_eq!(health["version"], hindsight::VERSION);
    assert_eq!(health["is_processing"], false);

    let (status, body) = get(&format!("{base}/api/version")).await;
    assert_eq!(status, 200);
    assert_eq!(parse(&body)["version"], hindsight::VERSION);

    let (status, _) = get(&format!("{base}/api/core-ready")).await;
    assert_eq!(status, 200);

    let pid = read_pid_file(&dir.path().join("worker.pid")).unwrap();
    assert_eq!(pid.port, worker.addr.port());
    assert_eq!(pid.pid, std::process::id());

    worker.shutdown().await;
    assert!(read_pid_file(&dir.path().join("worker.pid")).is_none());
}

#[tokio::test]
async fn ingest_then_read_back() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(FakeProvider::new(observation_xml("bugfix", "off by one in pager")));
    let (worker, base) = spawn_worker(&dir, Arc::clone(&provider)).await;

    let (status, body) = post_json(
        &format!("{base}/api/sessions/init"),
        json!({ "contentSessionId": "c-1", "project": "demo", "prompt": "fix paging" }),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(parse(&body)["prompt_number"], 1);

    let (status, body) = post_json(
        &format!("{base}/api/sessions/observations"),
        json!({
            "content_session_id": "c-1",
            "project": "demo",
            "tool_name": "Edit",
            "tool_input": { "file_path": "src/pager.rs" },
            "tool_response": "ok"
        }),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(parse(&body)["queued"], true);

    let sessions = worker.state.sessions.clone();
    wait_until(|| provider.calls() == 1 && !sessions.is_any_session_processing()).await;

    let (status, body) = get(&format!("{base}/api/search?project=demo&type=observations")).await;
    assert_eq!(status, 200, "{body}");
    let results = parse(&body);
    assert_eq!(results["strategy"], "sqlite");
    let observations = results["observations"].as_array().unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0]["type"], "bugfix");
    let id = observations[0]["id"].as_i64().unwrap();

    let (status, body) = get(&format!("{base}/api/search/by-type?obs_type=bugfix,feature")).await;
    assert_eq!(status, 200);
    assert_eq!(parse(&body)["observations"].as_array().unwrap().len(), 1);

    let (status, body) =
        post_json(&format!("{base}/api/observations/batch"), json!({ "ids": [id, 9999] })).await;
    assert_eq!(status, 200);
    let rows = parse(&body);
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["title"], "off by one in pager");

    let (status, body) = get(&format!("{base}/api/context/inject?project=demo")).await;
    assert_eq!(status, 200);
    assert!(body.contains("off by one in pager"));

    // Text search with no vector backend reports why it is empty.
    let (_, body) = get(&format!("{base}/api/search?query=pager")).await;
    assert_eq!(parse(&body)["reason"], "no_vector_backend");

    let (status, body) = post_json(
        &format!("{base}/api/sessions/complete"),
        json!({ "content_session_id": "c-1" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(parse(&body)["completed"], true);

    worker.shutdown().await;
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (worker, base) = spawn_worker(&dir, Arc::new(FakeProvider::new(""))).await;

    let (status, body) =
        post_json(&format!("{base}/api/sessions/init"), json!({ "project": "demo" })).await;
    assert_eq!(status, 400);
    let err = parse(&body);
    assert_eq!(err["code"], 400);
    assert!(err["error"].as_str().unwrap().contains("content_session_id"));

    let (status, _) = post_json(
        &format!("{base}/api/sessions/complete"),
        json!({ "content_session_id": "nope" }),
    )
    .await;
    assert_eq!(status, 404);

    let (status, _) = get(&format!("{base}/api/search?order_by=sideways")).await;
    assert_eq!(status, 400);

    let (status, _) = get(&format!("{base}/api/search/by-concept")).await;
    assert_eq!(status, 400);

    let (status, _) = get(&format!("{base}/api/context/inject")).await;
    assert_eq!(status, 400);

    // Retention is disabled by default.
    let (status, _) = post_json(&format!("{base}/api/admin/retention"), json!({})).await;
    assert_eq!(status, 400);

    worker.shutdown().await;
}

#[tokio::test]
async fn stream_opens_with_processing_status() {
    let dir = TempDir::new().unwrap();
    let (worker, base) = spawn_worker(&dir, Arc::new(FakeProvider::new(""))).await;

    let mut resp = reqwest::get(format!("{base}/stream")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: processing_status"), "{text}");
    drop(resp);

    worker.shutdown().await;
}

#[tokio::test]
async fn admin_shutdown_requests_stop_and_drains() {
    let dir = TempDir::new().unwrap();
    let (worker, base) = spawn_worker(&dir, Arc::new(FakeProvider::new(""))).await;

    let (status, body) = post_json(&format!("{base}/api/admin/shutdown"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(parse(&body)["ok"], true);
    assert!(worker.state.control.is_requested());

    let state = worker.state.clone();
    let addr = worker.addr;
    let reason = tokio::time::timeout(Duration::from_secs(10), worker.run_until_stopped())
        .await
        .unwrap();
    assert_eq!(reason, StopReason::Shutdown);
    assert_eq!(state.daemon.get(), DaemonState::Stopped);
    assert!(state.store.db().is_closed());

    let monitor = HealthMonitor::new(format!("http://{addr}"), Duration::from_millis(20));
    assert!(monitor.wait_for_port_free(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn ingestion_is_refused_while_shutting_down() {
    let dir = TempDir::new().unwrap();
    let (worker, base) = spawn_worker(&dir, Arc::new(FakeProvider::new(""))).await;

    assert!(worker.state.sessions.shutdown_all(Duration::from_millis(100)).await);
    let (status, body) = post_json(
        &format!("{base}/api/sessions/init"),
        json!({ "content_session_id": "c-1", "project": "demo" }),
    )
    .await;
    assert_eq!(status, 503, "{body}");

    worker.shutdown().await;
}

// --- router only, with a chosen peer address ---

fn app(config: HindsightConfig) -> Router {
    let store = plain_store();
    let sessions = session_manager(store.clone(), Arc::new(FakeProvider::new("")), None);
    let metrics = Arc::new(MetricsService::new(sessions.clone(), store.clone()).unwrap());
    let state = AppState::new(
        Arc::new(config),
        store,
        sessions,
        metrics,
        StateHandle::new(),
        ControlHandle::new(),
    );
    state.daemon.advance(DaemonState::Ready);
    create_router(state)
}

fn remote_config() -> HindsightConfig {
    let mut config = HindsightConfig::default();
    config.server.auth_token = Some(TOKEN.into());
    config
}

fn request(path: &str, peer: &str) -> axum::http::request::Builder {
    let addr: SocketAddr = peer.parse().unwrap();
    Request::builder().uri(path).extension(ConnectInfo(addr))
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn remote_clients_need_credentials() {
    let router = app(remote_config());

    let resp = router
        .clone()
        .oneshot(request("/api/sessions", "10.0.0.5:4000").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "authentication required");
    assert_eq!(body["code"], 401);

    let resp = router
        .clone()
        .oneshot(
            request("/api/sessions", "10.0.0.5:4000")
                .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .clone()
        .oneshot(
            request("/api/sessions", "10.0.0.5:4000")
                .header(header::AUTHORIZATION, "Bearer wrong-token-000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Exempt and loopback.
    let resp = router
        .clone()
        .oneshot(request("/health", "10.0.0.5:4000").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = router
        .oneshot(request("/api/sessions", "127.0.0.1:4000").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn browsers_are_sent_to_login_and_cookie_works() {
    let router = app(remote_config());

    let resp = router
        .clone()
        .oneshot(
            request("/api/metrics", "10.0.0.5:4000")
                .header(header::ACCEPT, "text/html")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_redirection());
    assert_eq!(resp.headers()[header::LOCATION], "/login");

    let login = |token: &str| {
        request("/api/auth/login", "10.0.0.5:4000")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "token": token }).to_string()))
            .unwrap()
    };
    let resp = router.clone().oneshot(login("nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router.clone().oneshot(login(TOKEN)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
    assert!(set_cookie.contains("HttpOnly"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    let resp = router
        .oneshot(
            request("/api/metrics", "10.0.0.5:4000")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let metrics = body_json(resp).await;
    assert!(metrics["uptime_secs"].is_u64());
}

#[tokio::test]
async fn remote_clients_are_rate_limited() {
    let mut config = remote_config();
    config.server.rate_limit.max_requests = 2;
    let router = app(config);

    let call = || {
        request("/api/version", "10.0.0.9:5000")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap()
    };
    let first = router.clone().oneshot(call()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");
    router.clone().oneshot(call()).await.unwrap();

    let limited = router.clone().oneshot(call()).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(body_json(limited).await["code"], 429);

    // Loopback is never limited.
    for _ in 0..3 {
        let resp = router
            .clone()
            .oneshot(request("/api/version", "127.0.0.1:5000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn unverified_tokens_share_the_ip_bucket() {
    let mut config = remote_config();
    config.server.rate_limit.max_requests = 2;
    let router = app(config);

    let call = |token: &str| {
        request("/api/version", "10.0.0.9:5000")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };
    let resp = router.clone().oneshot(call("bogus-one")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let resp = router.clone().oneshot(call("bogus-two")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let limited = router.clone().oneshot(call("bogus-three")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key(header::RETRY_AFTER));

    // A valid token still gets its own bucket.
    let resp = router.oneshot(call(TOKEN)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn prometheus_exposition_counts_requests() {
    let router = app(HindsightConfig::default());
    router
        .clone()
        .oneshot(request("/health", "127.0.0.1:1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let resp = router
        .oneshot(request("/metrics", "127.0.0.1:1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("hindsight_http_requests_total"));
}
