//! API integration tests.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use ambient::agui::{Event, EventType, RunIds, sse};
use ambient::live::LiveLine;

mod common;
use common::{
    TestApp, body_json, body_string, dev_auth, event_types, frames, spawn_failing_runner,
    spawn_runner, spawn_streaming_runner, sse_events, test_app, test_app_with, token_auth,
    unreachable_runner,
};

const SESSION_PATH: &str = "/projects/demo/sessions/s1";

async fn send(app: &TestApp, method: Method, path: &str, body: Option<Value>) -> Response {
    send_with_token(app, method, path, body, None).await
}

async fn send_with_token(
    app: &TestApp,
    method: Method,
    path: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> Response {
    let mut request = Request::builder()
        .uri(format!("{}{}", SESSION_PATH, path))
        .method(method)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    app.router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap()
}

fn run_input(messages: Value) -> Value {
    json!({"threadId": "s1", "runId": "r1", "messages": messages})
}

fn reconnect_input() -> Value {
    json!({"threadId": "s1", "messages": []})
}

fn finished_run() -> Vec<Value> {
    vec![
        json!({"type": "RUN_STARTED", "threadId": "s1", "runId": "r1"}),
        json!({"type": "TEXT_MESSAGE_START", "messageId": "a1", "role": "assistant"}),
        json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "a1", "delta": "Hi "}),
        json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "a1", "delta": "there"}),
        json!({"type": "TEXT_MESSAGE_END", "messageId": "a1"}),
        json!({"type": "RUN_FINISHED", "threadId": "s1", "runId": "r1"}),
    ]
}

async fn seed(app: &TestApp, events: &[Value]) {
    let log = app.state.relay.log();
    let ids = RunIds::new("s1", "r1");
    for value in events {
        let event: Event = serde_json::from_value(value.clone()).unwrap();
        log.append("s1", &event, &ids).await.unwrap();
    }
}

/// Test that health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app_with(unreachable_runner(), token_auth());

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_reconnect_to_empty_session_ends_immediately() {
    let app = test_app().await;

    let response = send(&app, Method::POST, "/agui/run", Some(reconnect_input())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    assert_eq!(body_string(response).await, "");
}

#[tokio::test]
async fn test_reconnect_after_finished_run_is_compacted() {
    let app = test_app().await;
    seed(&app, &finished_run()).await;

    let response = send(&app, Method::POST, "/agui/run", Some(reconnect_input())).await;
    let events = sse_events(&body_string(response).await);

    assert_eq!(
        event_types(&events),
        ["RUN_STARTED", "MESSAGES_SNAPSHOT", "RUN_FINISHED"]
    );
    assert!(events.iter().all(|e| e["runId"] == "r1" && e["threadId"] == "s1"));
    assert_eq!(
        events[1]["messages"],
        json!([{"id": "a1", "role": "assistant", "content": "Hi there"}])
    );
}

#[tokio::test]
async fn test_reconnect_after_failed_run_replays_raw() {
    let app = test_app().await;
    seed(
        &app,
        &[
            json!({"type": "RUN_STARTED", "threadId": "s1", "runId": "r1"}),
            json!({"type": "RUN_ERROR", "message": "boom"}),
        ],
    )
    .await;

    let response = send(&app, Method::POST, "/agui/run", Some(reconnect_input())).await;
    let events = sse_events(&body_string(response).await);
    assert_eq!(event_types(&events), ["RUN_STARTED", "RUN_ERROR"]);
    assert_eq!(events[1]["message"], "boom");
}

#[tokio::test]
async fn test_run_against_unreachable_runner_reports_error() {
    let app = test_app().await;

    let input = run_input(json!([{"id": "u1", "role": "user", "content": "Hello"}]));
    let response = send(&app, Method::POST, "/agui/run", Some(input)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = sse_events(&body_string(response).await);
    assert_eq!(event_types(&events), ["RUN_STARTED", "RUN_ERROR"]);
    assert_eq!(events[1]["message"], "Runner is not available");
    assert_eq!(events[1]["runId"], "r1");

    let persisted = app.state.relay.log().load("s1").await.unwrap();
    let types: Vec<_> = persisted.iter().filter_map(Event::event_type).collect();
    assert_eq!(types, [EventType::RunStarted, EventType::RunError]);
}

#[tokio::test]
async fn test_run_rejected_by_runner_reports_status() {
    let runner = spawn_failing_runner(StatusCode::SERVICE_UNAVAILABLE).await;
    let app = test_app_with(runner, dev_auth());

    let input = run_input(json!([{"id": "u1", "role": "user", "content": "Hello"}]));
    let response = send(&app, Method::POST, "/agui/run", Some(input)).await;
    let events = sse_events(&body_string(response).await);

    assert_eq!(event_types(&events), ["RUN_STARTED", "RUN_ERROR"]);
    assert_eq!(events[1]["message"], "Runner error: HTTP 503");
}

#[tokio::test]
async fn test_run_is_forwarded_and_persisted() {
    let runner = spawn_runner(finished_run()).await;
    let app = test_app_with(runner, dev_auth());

    let input = run_input(json!([{"id": "u1", "role": "user", "content": "Hello"}]));
    let response = send(&app, Method::POST, "/agui/run", Some(input)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let forwarded = sse_events(&body_string(response).await);
    assert_eq!(forwarded.len(), finished_run().len());

    let persisted = app.state.relay.log().load("s1").await.unwrap();
    assert_eq!(persisted.len(), finished_run().len());
    // The finished run no longer holds a writer.
    assert_eq!(app.state.relay.log().open_writers(), 0);
    // Events missing run ids are stamped with the run's ids.
    assert!(persisted.iter().all(|e| e.run_id() == Some("r1")));
    assert!(persisted.iter().all(|e| e.thread_id() == Some("s1")));

    let response = send(&app, Method::GET, "/agui/messages", None).await;
    let json = body_json(response).await;
    assert_eq!(
        json["messages"],
        json!([{"id": "a1", "role": "assistant", "content": "Hi there"}])
    );

    let response = send(&app, Method::GET, "/agui/activity", None).await;
    let json = body_json(response).await;
    assert_eq!(json["sessionId"], "s1");
    assert!(json["lastActivity"].is_string());
}

#[tokio::test]
async fn test_hidden_input_messages_are_marked() {
    let runner = spawn_runner(finished_run()).await;
    let app = test_app_with(runner, dev_auth());

    let input = run_input(json!([
        {"id": "u0", "role": "user", "content": "system prompt", "metadata": {"hidden": true}},
        {"id": "u1", "role": "user", "content": "Hello"}
    ]));
    let response = send(&app, Method::POST, "/agui/run", Some(input)).await;
    let forwarded = sse_events(&body_string(response).await);

    let expected = json!({"type": "message_metadata", "messageId": "u0", "hidden": true});
    let persisted = app.state.relay.log().load("s1").await.unwrap();
    let marker = persisted.first().unwrap();
    assert!(marker.is(EventType::Raw));
    assert_eq!(marker.get("event"), Some(&expected));
    assert_eq!(marker.run_id(), Some("r1"));

    // The caller sees the marker ahead of the runner's events.
    assert_eq!(forwarded.len(), finished_run().len() + 1);
    assert_eq!(forwarded[0]["type"], "RAW");
    assert_eq!(forwarded[0]["event"], expected);
    assert_eq!(forwarded[0]["runId"], "r1");
    assert_eq!(forwarded[1]["type"], "RUN_STARTED");
}

#[tokio::test]
async fn test_invalid_utf8_from_runner_does_not_end_run() {
    let events = finished_run();
    let mut body = frames(&events[..2]);
    body.extend_from_slice(b": comment \xff\xfe\n\n");
    body.extend_from_slice(&frames(&events[2..]));
    let runner = spawn_streaming_runner(vec![(Duration::ZERO, body)]).await;
    let app = test_app_with(runner, dev_auth());

    let input = run_input(json!([{"id": "u1", "role": "user", "content": "Hello"}]));
    let response = send(&app, Method::POST, "/agui/run", Some(input)).await;
    let text = body_string(response).await;
    assert!(text.contains("\u{FFFD}"));
    assert_eq!(event_types(&sse_events(&text)), event_types(&events));

    let persisted = app.state.relay.log().load("s1").await.unwrap();
    let types: Vec<_> = persisted.iter().filter_map(Event::event_type).collect();
    assert_eq!(
        types,
        [
            EventType::RunStarted,
            EventType::TextMessageStart,
            EventType::TextMessageContent,
            EventType::TextMessageContent,
            EventType::TextMessageEnd,
            EventType::RunFinished,
        ]
    );
}

#[tokio::test]
async fn test_reconnect_during_run_receives_live_events() {
    let events = finished_run();
    let pause = Duration::from_millis(150);
    let chunks = events
        .iter()
        .enumerate()
        .map(|(i, event)| {
            let delay = if i == 0 { Duration::ZERO } else { pause };
            (delay, frames(std::slice::from_ref(event)))
        })
        .collect();
    let runner = spawn_streaming_runner(chunks).await;
    let app = test_app_with(runner, dev_auth());

    let input = run_input(json!([{"id": "u1", "role": "user", "content": "Hello"}]));
    let direct = send(&app, Method::POST, "/agui/run", Some(input)).await;
    let direct = tokio::spawn(body_string(direct));

    let log = app.state.relay.log().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.load("s1").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(app.state.relay.hub().is_run_active("s1"));

    let response = send(&app, Method::POST, "/agui/run", Some(reconnect_input())).await;
    let viewed = tokio::time::timeout(Duration::from_secs(5), body_string(response))
        .await
        .unwrap();
    let viewed = sse_events(&viewed);

    // Snapshot plus live tail, each event once, ending on the terminal event.
    assert_eq!(event_types(&viewed), event_types(&events));
    assert_eq!(viewed[3]["delta"], "there");

    let direct = sse_events(&direct.await.unwrap());
    assert_eq!(event_types(&direct), event_types(&events));
}

#[tokio::test]
async fn test_live_tail_follows_active_run() {
    let app = test_app().await;
    let hub = app.state.relay.hub().clone();
    let log = app.state.relay.log().clone();
    let ids = RunIds::new("s1", "r1");

    let _run = hub.begin_run("s1");
    seed(&app, &[json!({"type": "RUN_STARTED", "threadId": "s1", "runId": "r1"})]).await;

    let response = send(&app, Method::POST, "/agui/run", Some(reconnect_input())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let first = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_data()
        .unwrap();
    assert!(String::from_utf8_lossy(&first).contains("RUN_STARTED"));

    for value in [
        json!({"type": "TEXT_MESSAGE_START", "messageId": "a1", "role": "assistant"}),
        json!({"type": "RUN_FINISHED"}),
    ] {
        let mut event: Event = serde_json::from_value(value).unwrap();
        event.fill_run_ids(&ids);
        let seq = log.append("s1", &event, &ids).await.unwrap();
        hub.publish("s1", LiveLine::new(seq, sse::frame(&event)));
    }

    let rest = tokio::time::timeout(Duration::from_secs(5), body.collect())
        .await
        .unwrap()
        .unwrap()
        .to_bytes();
    let events = sse_events(&String::from_utf8(rest.to_vec()).unwrap());
    assert_eq!(event_types(&events), ["TEXT_MESSAGE_START", "RUN_FINISHED"]);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = test_app_with(unreachable_runner(), token_auth());

    let response = send(&app, Method::GET, "/agui/capabilities", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send_with_token(
        &app,
        Method::GET,
        "/agui/capabilities",
        None,
        Some("unknown"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_reader_cannot_start_runs() {
    let app = test_app_with(unreachable_runner(), token_auth());

    let input = run_input(json!([{"id": "u1", "role": "user", "content": "Hello"}]));
    let response =
        send_with_token(&app, Method::POST, "/agui/run", Some(input), Some("reader")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!app.state.relay.log().exists("s1").await.unwrap());

    // A reconnect only needs read access.
    let response = send_with_token(
        &app,
        Method::POST,
        "/agui/run",
        Some(reconnect_input()),
        Some("reader"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send_with_token(
        &app,
        Method::POST,
        "/agui/interrupt",
        None,
        Some("reader"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_feedback_outcomes() {
    let app = test_app().await;
    let meta = json!({"type": "META", "metaType": "thumbs_up", "payload": {"messageId": "a1"}});

    let response = send(&app, Method::POST, "/agui/feedback", Some(meta.clone())).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["status"], "failed");

    let not_meta = json!({"type": "RAW", "event": {}});
    let response = send(&app, Method::POST, "/agui/feedback", Some(not_meta)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let runner = spawn_runner(vec![]).await;
    let app = test_app_with(runner, dev_auth());
    let response = send(&app, Method::POST, "/agui/feedback", Some(meta)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "sent");

    let persisted = app.state.relay.log().load("s1").await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].is(EventType::Raw));
    // The runner's own thread id is replaced by the session id.
    assert_eq!(persisted[0].thread_id(), Some("s1"));
}

#[tokio::test]
async fn test_interrupt_forwarding() {
    let app = test_app().await;
    let response = send(&app, Method::POST, "/agui/interrupt", None).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let runner = spawn_runner(vec![]).await;
    let app = test_app_with(runner, dev_auth());
    let response = send(&app, Method::POST, "/agui/interrupt", Some(json!({}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "Interrupt signal sent");

    let runner = spawn_failing_runner(StatusCode::CONFLICT).await;
    let app = test_app_with(runner, dev_auth());
    let response = send(&app, Method::POST, "/agui/interrupt", None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_capabilities_and_mcp_defaults() {
    let app = test_app().await;

    let response = send(&app, Method::GET, "/agui/capabilities", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["framework"], "unknown");
    assert_eq!(json["mcp"], false);

    let response = send(&app, Method::GET, "/mcp/status", None).await;
    assert_eq!(
        body_json(response).await,
        json!({"servers": [], "totalCount": 0})
    );

    let runner = spawn_runner(vec![]).await;
    let app = test_app_with(runner, dev_auth());
    let response = send(&app, Method::GET, "/agui/capabilities", None).await;
    assert_eq!(body_json(response).await["framework"], "stub");
}

#[tokio::test]
async fn test_messages_endpoint_migrates_legacy_log() {
    let app = test_app().await;
    let session_dir = app.dir.path().join("sessions").join("s1");
    std::fs::create_dir_all(&session_dir).unwrap();
    std::fs::write(
        session_dir.join("messages.json"),
        json!({
            "sessionId": "s1",
            "messages": [
                {"type": "user_message", "payload": {"content": "Hello"}},
                {"type": "agent.message", "payload": {"content": {"type": "text_block", "text": "Hi"}}}
            ]
        })
        .to_string(),
    )
    .unwrap();

    let response = send(&app, Method::GET, "/agui/messages", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let messages = body_json(response).await["messages"].clone();
    let roles: Vec<_> = messages
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(roles, ["user", "assistant"]);

    assert!(!session_dir.join("messages.json").exists());
    assert!(session_dir.join("messages.json.migrated").exists());

    // Second read serves the same history from the event log.
    let response = send(&app, Method::GET, "/agui/messages", None).await;
    assert_eq!(body_json(response).await["messages"], messages);
}

#[tokio::test]
async fn test_invalid_session_id_is_rejected() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/projects/demo/sessions/a..b/agui/messages")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_run_body_is_bad_request() {
    let app = test_app().await;
    let request = Request::builder()
        .uri(format!("{}/agui/run", SESSION_PATH))
        .method(Method::POST)
        .body(Body::from("not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
