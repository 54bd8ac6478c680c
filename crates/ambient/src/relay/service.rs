//! Run and reconnect orchestration.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_util::io::StreamReader;
use uuid::Uuid;

use super::activity::ActivityTracker;
use super::display_name::DisplayNameQueue;
use super::{RelayConfig, RelayError, RelayResult, SessionRef};
use crate::agui::sse::{self, HEARTBEAT};
use crate::agui::{Event, EventType, Message, RunAgentInput, RunIds};
use crate::compaction::compact_events;
use crate::events::{EventLog, LogSnapshot, validate_session_id};
use crate::live::{LiveHub, LiveLine, LiveSubscription, RunGuard};
use crate::migration::{LegacyMigrator, Migration};
use crate::runner::{RunnerClient, RunnerError};

/// Buffered SSE chunks towards one HTTP client.
const CLIENT_BUFFER: usize = 64;

/// SSE body chunks for one client. The stream ends when the sender is dropped.
pub type ClientStream = mpsc::Receiver<Bytes>;

/// How a reconnect serves persisted history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Nothing persisted and no run in flight.
    Empty,
    /// Last run finished: send a compacted snapshot and close.
    Compacted,
    /// Last run failed: replay raw events and close.
    Raw,
    /// Run in progress: replay raw events, then follow the live hub.
    RawThenTail,
}

impl ReplayMode {
    pub fn select(events: &[Event], run_active: bool) -> Self {
        match events.last().and_then(Event::event_type) {
            None if events.is_empty() && !run_active => ReplayMode::Empty,
            Some(EventType::RunFinished) => ReplayMode::Compacted,
            Some(EventType::RunError) => ReplayMode::Raw,
            _ => ReplayMode::RawThenTail,
        }
    }
}

/// Result of forwarding feedback to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// Runner acknowledged; its RAW event was persisted and published.
    Recorded,
    /// Runner acknowledged with a body that is not an event.
    NotRecorded,
    /// Runner could not be reached.
    RunnerUnavailable,
    /// Runner answered with this non-success status.
    RunnerStatus(u16),
}

/// Orchestrates runs, reconnects and the auxiliary runner calls.
pub struct Relay {
    log: Arc<EventLog>,
    hub: LiveHub,
    migrator: LegacyMigrator,
    runner: RunnerClient,
    activity: ActivityTracker,
    display_names: DisplayNameQueue,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        log: Arc<EventLog>,
        hub: LiveHub,
        runner: RunnerClient,
        display_names: DisplayNameQueue,
        config: RelayConfig,
    ) -> Self {
        Self {
            migrator: LegacyMigrator::new(log.clone()),
            log,
            hub,
            runner,
            activity: ActivityTracker::new(),
            display_names,
            config,
        }
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn hub(&self) -> &LiveHub {
        &self.hub
    }

    pub fn runner(&self) -> &RunnerClient {
        &self.runner
    }

    /// Serve `POST /agui/run`: a new run when the input carries messages,
    /// otherwise a reconnect.
    pub async fn run(
        self: &Arc<Self>,
        target: SessionRef,
        input: RunAgentInput,
    ) -> RelayResult<ClientStream> {
        validate_session_id(&target.session)?;
        if input.messages.is_empty() {
            self.reconnect(target).await
        } else {
            Ok(self.start_run(target, input))
        }
    }

    /// Start a new run against the session's runner.
    pub fn start_run(self: &Arc<Self>, target: SessionRef, mut input: RunAgentInput) -> ClientStream {
        let thread_id = if input.thread_id.is_empty() {
            target.session.clone()
        } else {
            input.thread_id.clone()
        };
        let run_id = if input.run_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            input.run_id.clone()
        };
        let ids = RunIds::new(thread_id, run_id);
        input.thread_id = ids.thread_id.clone();
        input.run_id = ids.run_id.clone();

        info!(
            "Starting run {} for session {}/{}",
            ids.run_id, target.project, target.session
        );

        let guard = self.hub.begin_run(&target.session);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let relay = self.clone();
        tokio::spawn(async move {
            relay.drive_run(target, input, ids, tx, guard).await;
        });
        rx
    }

    async fn drive_run(
        &self,
        target: SessionRef,
        input: RunAgentInput,
        ids: RunIds,
        tx: mpsc::Sender<Bytes>,
        guard: RunGuard,
    ) {
        self.stream_run(&target, &input, &ids, &tx).await;
        drop(guard);
        self.release_idle(&target.session);
        debug!("Run {} for session {} ended", ids.run_id, target.session);
    }

    async fn stream_run(
        &self,
        target: &SessionRef,
        input: &RunAgentInput,
        ids: &RunIds,
        tx: &mpsc::Sender<Bytes>,
    ) {
        let session = target.session.as_str();
        let messages = input.input_messages();

        if let Some(prompt) = messages
            .iter()
            .filter(|m| m.role == "user")
            .find_map(|m| m.text())
        {
            self.display_names.submit(target, prompt);
        }

        for message in messages.iter().filter(|m| m.is_hidden() && !m.id.is_empty()) {
            let marker = Event::new(EventType::Raw).with(
                "event",
                json!({
                    "type": "message_metadata",
                    "messageId": message.id,
                    "hidden": true,
                }),
            );
            let line = self.record(session, marker, ids).await;
            let _ = tx.send(Bytes::from(line)).await;
        }

        let response = match self.runner.run(&target.project, session, input).await {
            Ok(response) => response,
            Err(err) => {
                warn!("Run {} for session {} failed: {}", ids.run_id, session, err);
                self.emit_run_failure(session, ids, &err, tx).await;
                return;
            }
        };

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(Box::pin(body));
        let mut buf = Vec::new();
        let mut client_open = true;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("Runner stream for session {} broke: {}", session, err);
                    break;
                }
            }

            // Invalid UTF-8 is replaced, never fatal to the stream.
            let mut line = match String::from_utf8(std::mem::take(&mut buf)) {
                Ok(line) => line,
                Err(err) => {
                    warn!("Runner sent invalid UTF-8 for session {}", session);
                    String::from_utf8_lossy(err.as_bytes()).into_owned()
                }
            };

            if let Some(event) = sse::parse_data_line(&line) {
                self.record(session, event, ids).await;
            } else if sse::data_payload(&line).is_some() {
                warn!("Dropping unparseable runner event for session {}", session);
            }

            if client_open {
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if tx.send(Bytes::from(line)).await.is_err() {
                    info!(
                        "Client left session {}, still recording run {}",
                        session, ids.run_id
                    );
                    client_open = false;
                }
            }
        }
    }

    /// Drop cached writer state once no run is appending to the session.
    fn release_idle(&self, session: &str) {
        if !self.hub.is_run_active(session) {
            self.log.release(session);
        }
    }

    /// Persist, then publish. Returns the framed line.
    async fn record(&self, session: &str, mut event: Event, ids: &RunIds) -> String {
        event.fill_run_ids(ids);
        let line = sse::frame(&event);
        match self.log.append(session, &event, ids).await {
            Ok(seq) => {
                self.hub.publish(session, LiveLine::new(seq, line.as_str()));
            }
            Err(err) => warn!("Failed to persist event for session {}: {}", session, err),
        }
        if let Some(event_type) = event.event_type() {
            self.activity.observe(session, event_type, Utc::now());
        }
        line
    }

    async fn emit_run_failure(
        &self,
        session: &str,
        ids: &RunIds,
        err: &RunnerError,
        tx: &mpsc::Sender<Bytes>,
    ) {
        let message = match err {
            RunnerError::Status { status } => format!("Runner error: HTTP {}", status),
            _ => "Runner is not available".to_string(),
        };
        let events = [
            Event::new(EventType::RunStarted),
            Event::new(EventType::RunError).with("message", message),
        ];
        for event in events {
            let line = self.record(session, event, ids).await;
            // Client may be gone; the pair is on disk either way.
            let _ = tx.send(Bytes::from(line)).await;
        }
    }

    /// Serve a reconnect from persisted history, following the live hub
    /// while a run is still in progress.
    pub async fn reconnect(self: &Arc<Self>, target: SessionRef) -> RelayResult<ClientStream> {
        let session = target.session.clone();
        validate_session_id(&session)?;

        match self.migrator.migrate(&session).await {
            Ok(Migration::Migrated { .. }) => self.release_idle(&session),
            Ok(Migration::NotNeeded) => {}
            Err(err) => warn!("Legacy migration for session {} failed: {}", session, err),
        }

        // Subscribe before loading: anything published later is either in
        // the snapshot (seq < cursor) or delivered on this subscription.
        let subscription = self.hub.subscribe(&session);
        let snapshot = self.log.load_snapshot(&session).await?;
        let mode = ReplayMode::select(&snapshot.events, self.hub.is_run_active(&session));
        info!(
            "Reconnect to session {}: {} events, mode {:?}",
            session,
            snapshot.events.len(),
            mode
        );

        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        match mode {
            ReplayMode::Empty => {}
            ReplayMode::Compacted => {
                drop(subscription);
                tokio::spawn(async move {
                    send_compacted(&session, &snapshot.events, &tx).await;
                });
            }
            ReplayMode::Raw => {
                drop(subscription);
                tokio::spawn(async move {
                    send_raw(&snapshot.events, &tx).await;
                });
            }
            ReplayMode::RawThenTail => {
                let relay = self.clone();
                tokio::spawn(async move {
                    relay.replay_and_tail(subscription, snapshot, tx).await;
                });
            }
        }
        Ok(rx)
    }

    async fn replay_and_tail(
        &self,
        mut subscription: LiveSubscription,
        snapshot: LogSnapshot,
        tx: mpsc::Sender<Bytes>,
    ) {
        if !send_raw(&snapshot.events, &tx).await {
            return;
        }

        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                live = subscription.recv() => match live {
                    // Already replayed from the log.
                    Some(live) if live.seq < snapshot.cursor => continue,
                    Some(live) => {
                        if tx.send(Bytes::from(live.line.to_string())).await.is_err() {
                            break;
                        }
                        if sse::is_terminal_frame(&live.line) {
                            debug!("Run ended on session {}, closing tail", subscription.session());
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if tx.send(Bytes::from_static(HEARTBEAT.as_bytes())).await.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        subscription.cleanup();
    }

    /// Compacted message view of a session.
    pub async fn messages(&self, target: &SessionRef) -> RelayResult<Vec<Message>> {
        validate_session_id(&target.session)?;
        match self.migrator.migrate(&target.session).await {
            Ok(Migration::Migrated { .. }) => self.release_idle(&target.session),
            Ok(Migration::NotNeeded) => {}
            Err(err) => warn!(
                "Legacy migration for session {} failed: {}",
                target.session, err
            ),
        }
        let events = self.log.load(&target.session).await?;
        Ok(compact_events(&events))
    }

    pub async fn interrupt(&self, target: &SessionRef, body: &Value) -> RelayResult<()> {
        validate_session_id(&target.session)?;
        self.runner
            .interrupt(&target.project, &target.session, body)
            .await?;
        info!("Interrupt sent to session {}", target.session);
        Ok(())
    }

    /// Forward a META feedback event and record the runner's RAW answer.
    pub async fn feedback(&self, target: &SessionRef, event: Event) -> RelayResult<FeedbackOutcome> {
        validate_session_id(&target.session)?;
        if !event.is(EventType::Meta) {
            return Err(RelayError::InvalidEvent(
                "feedback must be a META event".to_string(),
            ));
        }

        let answer = match self
            .runner
            .feedback(&target.project, &target.session, &event)
            .await
        {
            Ok(answer) => answer,
            Err(RunnerError::Status { status }) => {
                warn!("Runner rejected feedback for {}: HTTP {}", target.session, status);
                return Ok(FeedbackOutcome::RunnerStatus(status));
            }
            Err(err) => {
                warn!("Feedback for {} not delivered: {}", target.session, err);
                return Ok(FeedbackOutcome::RunnerUnavailable);
            }
        };

        match answer {
            Some(raw) => {
                let raw = raw.with("threadId", target.session.as_str());
                let ids = RunIds::new(target.session.as_str(), "");
                self.record(&target.session, raw, &ids).await;
                self.release_idle(&target.session);
                Ok(FeedbackOutcome::Recorded)
            }
            None => Ok(FeedbackOutcome::NotRecorded),
        }
    }

    pub async fn capabilities(&self, target: &SessionRef) -> Value {
        self.runner
            .capabilities(&target.project, &target.session)
            .await
    }

    pub async fn mcp_status(&self, target: &SessionRef) -> Value {
        self.runner.mcp_status(&target.project, &target.session).await
    }

    pub fn last_activity(&self, target: &SessionRef) -> Option<DateTime<Utc>> {
        self.activity.last_activity(&target.session)
    }
}

/// Replay events verbatim. Returns false once the client is gone.
async fn send_raw(events: &[Event], tx: &mpsc::Sender<Bytes>) -> bool {
    for event in events {
        if tx.send(Bytes::from(sse::frame(event))).await.is_err() {
            return false;
        }
    }
    true
}

async fn send_compacted(session: &str, events: &[Event], tx: &mpsc::Sender<Bytes>) {
    let messages = compact_events(events);
    let ids = last_run_ids(events, session);
    let frames = [
        Event::new(EventType::RunStarted),
        Event::new(EventType::MessagesSnapshot)
            .with("messages", serde_json::to_value(&messages).unwrap_or_default()),
        Event::new(EventType::RunFinished),
    ];
    for mut event in frames {
        event.fill_run_ids(&ids);
        if tx.send(Bytes::from(sse::frame(&event))).await.is_err() {
            return;
        }
    }
}

/// Thread and run ids of the most recent event carrying a run id.
fn last_run_ids(events: &[Event], session: &str) -> RunIds {
    events
        .iter()
        .rev()
        .find_map(|e| {
            e.run_id().map(|run_id| {
                RunIds::new(e.thread_id().unwrap_or(session), run_id)
            })
        })
        .unwrap_or_else(|| RunIds::new(session, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> Event {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_replay_mode_selection() {
        assert_eq!(ReplayMode::select(&[], false), ReplayMode::Empty);
        assert_eq!(ReplayMode::select(&[], true), ReplayMode::RawThenTail);

        let finished = vec![
            event(json!({"type": "RUN_STARTED"})),
            event(json!({"type": "RUN_FINISHED"})),
        ];
        assert_eq!(ReplayMode::select(&finished, false), ReplayMode::Compacted);

        let failed = vec![event(json!({"type": "RUN_ERROR", "message": "x"}))];
        assert_eq!(ReplayMode::select(&failed, false), ReplayMode::Raw);

        let active = vec![event(json!({"type": "TEXT_MESSAGE_CONTENT", "delta": "x"}))];
        assert_eq!(ReplayMode::select(&active, false), ReplayMode::RawThenTail);
    }

    #[test]
    fn test_last_run_ids() {
        let events = vec![
            event(json!({"type": "RUN_STARTED", "threadId": "t", "runId": "r1"})),
            event(json!({"type": "RUN_STARTED", "threadId": "t", "runId": "r2"})),
            event(json!({"type": "RAW"})),
        ];
        assert_eq!(last_run_ids(&events, "s"), RunIds::new("t", "r2"));
        assert_eq!(last_run_ids(&[], "s"), RunIds::new("s", ""));
    }

    #[tokio::test]
    async fn test_compacted_replay_is_three_events() {
        let events = vec![
            event(json!({"type": "RUN_STARTED", "threadId": "s", "runId": "r"})),
            event(json!({"type": "TEXT_MESSAGE_START", "messageId": "m1", "role": "user"})),
            event(json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "m1", "delta": "Hi"})),
            event(json!({"type": "TEXT_MESSAGE_END", "messageId": "m1"})),
            event(json!({"type": "RUN_FINISHED", "threadId": "s", "runId": "r"})),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        send_compacted("s", &events, &tx).await;
        drop(tx);

        let mut frames = Vec::new();
        while let Some(chunk) = rx.recv().await {
            frames.push(sse::parse_data_line(std::str::from_utf8(&chunk).unwrap()).unwrap());
        }
        let types: Vec<_> = frames.iter().filter_map(Event::type_str).collect();
        assert_eq!(types, ["RUN_STARTED", "MESSAGES_SNAPSHOT", "RUN_FINISHED"]);
        assert!(frames.iter().all(|f| f.run_id() == Some("r")));
        assert_eq!(
            frames[1].get("messages"),
            Some(&json!([{"id": "m1", "role": "user", "content": "Hi"}]))
        );
    }
}
