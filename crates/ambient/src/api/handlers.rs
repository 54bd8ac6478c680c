//! API request handlers.

use std::convert::Infallible;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{info, instrument};

use crate::agui::{Event, Message, RunAgentInput};
use crate::auth::{self, Verb};
use crate::relay::{ClientStream, FeedbackOutcome, SessionRef};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    verb: Verb,
    target: &SessionRef,
) -> ApiResult<()> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    auth::authorize(state.access.as_ref(), header, verb, target).await?;
    Ok(())
}

fn sse_response(stream: ClientStream) -> Response {
    let body = Body::from_stream(ReceiverStream::new(stream).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// `POST /agui/run`: start a run, or reconnect when no messages are sent.
#[instrument(skip(state, headers, body))]
pub async fn run_agent(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let target = SessionRef::new(project, session);
    let input: RunAgentInput = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid run input: {}", e)))?;

    let verb = if input.messages.is_empty() {
        Verb::Get
    } else {
        Verb::Update
    };
    authorize(&state, &headers, verb, &target).await?;

    let stream = state.relay.run(target, input).await?;
    Ok(sse_response(stream))
}

/// `POST /agui/interrupt`
#[instrument(skip(state, headers, body))]
pub async fn interrupt(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let target = SessionRef::new(project, session);
    authorize(&state, &headers, Verb::Update, &target).await?;

    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid interrupt body: {}", e)))?
    };

    state.relay.interrupt(&target, &payload).await?;
    Ok(Json(json!({ "message": "Interrupt signal sent" })))
}

/// `POST /agui/feedback`
#[instrument(skip(state, headers, body))]
pub async fn feedback(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let target = SessionRef::new(project, session);
    authorize(&state, &headers, Verb::Update, &target).await?;

    let event = Event::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid feedback event: {}", e)))?;

    let (status, body) = match state.relay.feedback(&target, event).await? {
        FeedbackOutcome::Recorded => (StatusCode::OK, json!({ "status": "sent" })),
        FeedbackOutcome::NotRecorded => (
            StatusCode::OK,
            json!({ "status": "sent", "message": "Feedback sent but not persisted" }),
        ),
        FeedbackOutcome::RunnerUnavailable => (
            StatusCode::ACCEPTED,
            json!({ "status": "failed", "message": "Runner unavailable, feedback not recorded" }),
        ),
        FeedbackOutcome::RunnerStatus(code) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
            json!({ "status": "failed", "message": format!("Runner returned HTTP {}", code) }),
        ),
    };
    info!(status = %status, "Feedback handled");
    Ok((status, Json(body)).into_response())
}

/// `GET /agui/capabilities`
pub async fn capabilities(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let target = SessionRef::new(project, session);
    authorize(&state, &headers, Verb::Get, &target).await?;
    Ok(Json(state.relay.capabilities(&target).await))
}

/// `GET /mcp/status`
pub async fn mcp_status(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let target = SessionRef::new(project, session);
    authorize(&state, &headers, Verb::Get, &target).await?;
    Ok(Json(state.relay.mcp_status(&target).await))
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

/// `GET /agui/messages`: compacted message view.
pub async fn messages(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<MessagesResponse>> {
    let target = SessionRef::new(project, session);
    authorize(&state, &headers, Verb::Get, &target).await?;
    let messages = state.relay.messages(&target).await?;
    Ok(Json(MessagesResponse { messages }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    pub session_id: String,
    pub last_activity: Option<DateTime<Utc>>,
}

/// `GET /agui/activity`
pub async fn activity(
    State(state): State<AppState>,
    Path((project, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<ActivityResponse>> {
    let target = SessionRef::new(project, session);
    authorize(&state, &headers, Verb::Get, &target).await?;
    Ok(Json(ActivityResponse {
        last_activity: state.relay.last_activity(&target),
        session_id: target.session,
    }))
}
