//! Test utilities and common setup.

#![allow(dead_code)]

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    http::{StatusCode, header},
    response::Response,
    routing::{get, post},
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

use ambient::api::{self, AppState};
use ambient::auth::{AuthConfig, TokenGrant, Verb};
use ambient::relay::RelayConfig;
use ambient::runner::RunnerConfig;

/// Router plus the state and temp dir backing it.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    /// Keeps the state directory alive for the test.
    pub dir: TempDir,
}

pub fn dev_auth() -> AuthConfig {
    AuthConfig {
        dev_mode: true,
        ..Default::default()
    }
}

/// Tokens: `reader` may only get, `writer` may get and update.
pub fn token_auth() -> AuthConfig {
    AuthConfig {
        dev_mode: false,
        tokens: vec![
            TokenGrant {
                token: "reader".to_string(),
                subject: "viewer".to_string(),
                verbs: vec![Verb::Get],
                projects: vec![],
            },
            TokenGrant {
                token: "writer".to_string(),
                subject: "owner".to_string(),
                verbs: vec![Verb::Get, Verb::Update],
                projects: vec![],
            },
        ],
        allowed_origins: vec![],
    }
}

/// A runner URL nothing listens on.
pub fn unreachable_runner() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/", port)
}

/// Create a test application in dev mode with no reachable runner.
pub async fn test_app() -> TestApp {
    test_app_with(unreachable_runner(), dev_auth())
}

/// Must run inside a Tokio runtime.
pub fn test_app_with(runner_url: String, auth: AuthConfig) -> TestApp {
    let dir = TempDir::new().unwrap();
    let runner = RunnerConfig {
        url_template: runner_url,
        connect_attempts: 1,
        retry_backoff_ms: 10,
        connect_timeout_secs: 2,
        request_timeout_secs: 5,
        ..Default::default()
    };
    let relay = RelayConfig {
        heartbeat_secs: 1,
        ..Default::default()
    };
    let state = AppState::from_settings(dir.path(), relay, runner, auth).unwrap();
    TestApp {
        router: api::create_router(state.clone()),
        state,
        dir,
    }
}

/// One SSE frame per event.
pub fn frames(events: &[Value]) -> Vec<u8> {
    events
        .iter()
        .map(|event| format!("data: {}\n\n", event))
        .collect::<String>()
        .into_bytes()
}

/// Spawn a stub runner that answers every run with `events` as SSE frames.
///
/// Returns the base URL.
pub async fn spawn_runner(events: Vec<Value>) -> String {
    spawn_streaming_runner(vec![(Duration::ZERO, frames(&events))]).await
}

/// Spawn a stub runner whose run body is written chunk by chunk, sleeping
/// before each chunk. Chunks are raw bytes and need not be valid UTF-8.
pub async fn spawn_streaming_runner(chunks: Vec<(Duration, Vec<u8>)>) -> String {
    let app = Router::new()
        .route(
            "/",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    let body = stream::iter(chunks).then(|(delay, chunk)| async move {
                        tokio::time::sleep(delay).await;
                        Ok::<_, Infallible>(Bytes::from(chunk))
                    });
                    Response::builder()
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .body(Body::from_stream(body))
                        .unwrap()
                }
            }),
        )
        .route("/interrupt", post(|| async { StatusCode::OK }))
        .route(
            "/feedback",
            post(|Json(event): Json<Value>| async move {
                Json(json!({
                    "type": "RAW",
                    "threadId": "runner-thread",
                    "event": {"type": "feedback_recorded", "original": event}
                }))
            }),
        )
        .route(
            "/capabilities",
            get(|| async { Json(json!({"framework": "stub", "mcp": true})) }),
        );

    serve_stub(app).await
}

/// Spawn a stub runner that rejects everything with `status`.
pub async fn spawn_failing_runner(status: StatusCode) -> String {
    let app = Router::new().fallback(move || async move { status });
    serve_stub(app).await
}

async fn serve_stub(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/", addr)
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

/// Parse every `data:` frame of an SSE body.
pub fn sse_events(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| serde_json::from_str(payload.trim_start()).unwrap())
        .collect()
}

pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
