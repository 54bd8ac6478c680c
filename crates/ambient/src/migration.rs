//! One-shot conversion of legacy `messages.json` logs.
//!
//! Older sessions stored a flat list of `{type, payload}` records. On first
//! access the list is converted into a single MESSAGES_SNAPSHOT event in the
//! session's event log and the legacy file is renamed to `*.migrated`, so the
//! conversion never runs twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agui::{Event, EventType, Message, Role, RunIds, ToolCall, ToolCallStatus};
use crate::events::{EventLog, StoreError, StoreResult};

/// `runId` stamped on migrated snapshots.
pub const MIGRATION_RUN_ID: &str = "legacy-migration";

const MIGRATED_SUFFIX: &str = ".migrated";

#[derive(Debug, Deserialize)]
struct LegacyLog {
    #[serde(default)]
    messages: Vec<LegacyRecord>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    #[serde(default, rename = "type")]
    record_type: String,
    #[serde(default)]
    payload: Value,
}

/// Outcome of a migration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    /// No legacy file; nothing to do.
    NotNeeded,
    /// Converted; `messages` chat messages were written as one snapshot.
    Migrated { messages: usize },
}

/// Converts legacy message logs into event-log snapshots.
pub struct LegacyMigrator {
    log: Arc<EventLog>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LegacyMigrator {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            log,
            locks: DashMap::new(),
        }
    }

    /// Migrate the session's legacy log if one exists.
    pub async fn migrate(&self, session: &str) -> StoreResult<Migration> {
        let legacy_path = self.log.legacy_path(session)?;

        let lock = self.locks.entry(session.to_string()).or_default().clone();
        let result = {
            let _held = lock.lock().await;
            self.migrate_locked(session, &legacy_path).await
        };
        drop(lock);
        // Only the map holds it now: nobody is waiting on this session.
        self.locks
            .remove_if(session, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of sessions with a migration in progress or queued.
    pub fn pending(&self) -> usize {
        self.locks.len()
    }

    async fn migrate_locked(&self, session: &str, legacy_path: &Path) -> StoreResult<Migration> {
        let data = match tokio::fs::read(legacy_path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Migration::NotNeeded);
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            "Found legacy messages.json for session {}, converting",
            session
        );
        let legacy: LegacyLog =
            serde_json::from_slice(&data).map_err(|source| StoreError::Legacy {
                path: legacy_path.to_path_buf(),
                source,
            })?;

        let messages = convert_records(&legacy.messages);
        let count = messages.len();

        if count == 0 {
            debug!("Legacy log for {} holds no chat messages", session);
        } else {
            let snapshot = Event::new(EventType::MessagesSnapshot)
                .with("threadId", session)
                .with("runId", MIGRATION_RUN_ID)
                .with(
                    "timestamp",
                    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                )
                .with("messages", serde_json::to_value(&messages).unwrap_or_default());
            self.log
                .append(session, &snapshot, &RunIds::new(session, MIGRATION_RUN_ID))
                .await?;
            info!(
                "Persisted MESSAGES_SNAPSHOT with {} legacy messages for {}",
                count, session
            );
        }

        let migrated = migrated_path(legacy_path);
        if let Err(err) = tokio::fs::rename(legacy_path, &migrated).await {
            warn!(
                "Failed to rename {} to {}: {}",
                legacy_path.display(),
                migrated.display(),
                err
            );
        }

        Ok(Migration::Migrated { messages: count })
    }
}

fn migrated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(MIGRATED_SUFFIX);
    PathBuf::from(name)
}

fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Convert legacy records into chat messages.
fn convert_records(records: &[LegacyRecord]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    // tool_use id -> index of the message holding it
    let mut pending: Vec<(String, usize)> = Vec::new();

    for record in records {
        match record.record_type.as_str() {
            "user_message" => {
                let content = record
                    .payload
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                messages.push(Message::new(new_message_id(), Role::User, content));
            }
            "agent.message" => {
                let Some(block) = record.payload.get("content").filter(|c| c.is_object()) else {
                    continue;
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("text_block") => {
                        let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                        messages.push(Message::new(new_message_id(), Role::Assistant, text));
                    }
                    Some("tool_use_block") => {
                        let Some(id) = block.get("id").and_then(Value::as_str) else {
                            continue;
                        };
                        let idx = match messages.last() {
                            Some(last) if last.role == Role::Assistant => messages.len() - 1,
                            _ => {
                                messages.push(Message::new(
                                    new_message_id(),
                                    Role::Assistant,
                                    String::new(),
                                ));
                                messages.len() - 1
                            }
                        };
                        messages[idx].tool_calls.push(ToolCall {
                            id: id.to_string(),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            args: block.get("input").map(Value::to_string).unwrap_or_default(),
                            call_type: "function".to_string(),
                            parent_tool_use_id: String::new(),
                            result: String::new(),
                            status: ToolCallStatus::Running,
                            error: String::new(),
                        });
                        pending.push((id.to_string(), idx));
                    }
                    Some("tool_result_block") => complete_tool_use(&mut messages, &mut pending, block),
                    _ => {}
                }
            }
            // system.message, agent.running, agent.waiting and the rest are not chat.
            _ => {}
        }
    }

    if !pending.is_empty() {
        debug!("Dropping {} legacy tool uses without results", pending.len());
    }
    for message in &mut messages {
        message
            .tool_calls
            .retain(|call| call.status != ToolCallStatus::Running);
    }
    messages.retain(|m| !(m.content.is_empty() && m.tool_calls.is_empty() && m.role == Role::Assistant));
    messages
}

fn complete_tool_use(messages: &mut [Message], pending: &mut Vec<(String, usize)>, block: &Value) {
    let Some(tool_use_id) = block.get("tool_use_id").and_then(Value::as_str) else {
        return;
    };
    let Some(pos) = pending.iter().position(|(id, _)| id == tool_use_id) else {
        debug!("Legacy tool result for unknown tool use {}", tool_use_id);
        return;
    };
    let (_, idx) = pending.remove(pos);

    let content = match block.get("content") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let is_error = block
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(call) = messages[idx]
        .tool_calls
        .iter_mut()
        .find(|c| c.id == tool_use_id)
    {
        if is_error {
            call.status = ToolCallStatus::Error;
            call.error = content;
        } else {
            call.status = ToolCallStatus::Completed;
            call.result = content;
        }
    }
}
