//! AG-UI wire types.
//!
//! Events travel as schema-loose JSON objects. [`Event`] keeps the object
//! exactly as received (field order included) so persistence never drops or
//! invents fields; the typed view used by compaction lives in
//! [`super::decode`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminant of an AG-UI event (`type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    RunFinished,
    RunError,
    StepStarted,
    StepFinished,
    TextMessageStart,
    TextMessageContent,
    TextMessageEnd,
    TextMessageChunk,
    ToolCallStart,
    ToolCallArgs,
    ToolCallEnd,
    ToolCallChunk,
    ToolCallResult,
    StateSnapshot,
    StateDelta,
    ActivitySnapshot,
    ActivityDelta,
    MessagesSnapshot,
    Raw,
    Custom,
    Meta,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "RUN_STARTED",
            EventType::RunFinished => "RUN_FINISHED",
            EventType::RunError => "RUN_ERROR",
            EventType::StepStarted => "STEP_STARTED",
            EventType::StepFinished => "STEP_FINISHED",
            EventType::TextMessageStart => "TEXT_MESSAGE_START",
            EventType::TextMessageContent => "TEXT_MESSAGE_CONTENT",
            EventType::TextMessageEnd => "TEXT_MESSAGE_END",
            EventType::TextMessageChunk => "TEXT_MESSAGE_CHUNK",
            EventType::ToolCallStart => "TOOL_CALL_START",
            EventType::ToolCallArgs => "TOOL_CALL_ARGS",
            EventType::ToolCallEnd => "TOOL_CALL_END",
            EventType::ToolCallChunk => "TOOL_CALL_CHUNK",
            EventType::ToolCallResult => "TOOL_CALL_RESULT",
            EventType::StateSnapshot => "STATE_SNAPSHOT",
            EventType::StateDelta => "STATE_DELTA",
            EventType::ActivitySnapshot => "ACTIVITY_SNAPSHOT",
            EventType::ActivityDelta => "ACTIVITY_DELTA",
            EventType::MessagesSnapshot => "MESSAGES_SNAPSHOT",
            EventType::Raw => "RAW",
            EventType::Custom => "CUSTOM",
            EventType::Meta => "META",
        }
    }

    /// Parse a wire discriminant. Unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let ty = match s {
            "RUN_STARTED" => EventType::RunStarted,
            "RUN_FINISHED" => EventType::RunFinished,
            "RUN_ERROR" => EventType::RunError,
            "STEP_STARTED" => EventType::StepStarted,
            "STEP_FINISHED" => EventType::StepFinished,
            "TEXT_MESSAGE_START" => EventType::TextMessageStart,
            "TEXT_MESSAGE_CONTENT" => EventType::TextMessageContent,
            "TEXT_MESSAGE_END" => EventType::TextMessageEnd,
            "TEXT_MESSAGE_CHUNK" => EventType::TextMessageChunk,
            "TOOL_CALL_START" => EventType::ToolCallStart,
            "TOOL_CALL_ARGS" => EventType::ToolCallArgs,
            "TOOL_CALL_END" => EventType::ToolCallEnd,
            "TOOL_CALL_CHUNK" => EventType::ToolCallChunk,
            "TOOL_CALL_RESULT" => EventType::ToolCallResult,
            "STATE_SNAPSHOT" => EventType::StateSnapshot,
            "STATE_DELTA" => EventType::StateDelta,
            "ACTIVITY_SNAPSHOT" => EventType::ActivitySnapshot,
            "ACTIVITY_DELTA" => EventType::ActivityDelta,
            "MESSAGES_SNAPSHOT" => EventType::MessagesSnapshot,
            "RAW" => EventType::Raw,
            "CUSTOM" => EventType::Custom,
            "META" => EventType::Meta,
            _ => return None,
        };
        Some(ty)
    }

    /// Event types that count as session activity.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            EventType::RunStarted
                | EventType::TextMessageStart
                | EventType::TextMessageContent
                | EventType::ToolCallStart
        )
    }

    /// Event types that end a run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, EventType::RunFinished | EventType::RunError)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single AG-UI event as it appears on the wire and in the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Start a new event of the given type.
    pub fn new(event_type: EventType) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::from(event_type.as_str()));
        Self(fields)
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Parse one JSON object. Anything that is not an object is rejected.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> String {
        // Serializing a Map<String, Value> cannot fail.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Raw `type` string, if present.
    pub fn type_str(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.type_str().and_then(EventType::parse)
    }

    pub fn is(&self, event_type: EventType) -> bool {
        self.event_type() == Some(event_type)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.str_field("threadId").filter(|s| !s.is_empty())
    }

    pub fn run_id(&self) -> Option<&str> {
        self.str_field("runId").filter(|s| !s.is_empty())
    }

    /// Fill `threadId`/`runId` only where absent, null or empty.
    ///
    /// Existing values are never overwritten and empty defaults are ignored.
    pub fn fill_run_ids(&mut self, ids: &RunIds) {
        fill_if_missing(&mut self.0, "threadId", &ids.thread_id);
        fill_if_missing(&mut self.0, "runId", &ids.run_id);
    }
}

fn fill_if_missing(fields: &mut Map<String, Value>, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let missing = match fields.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if missing {
        fields.insert(key.to_string(), Value::from(value));
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Thread and run identifiers of the run an event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunIds {
    pub thread_id: String,
    pub run_id: String,
}

impl RunIds {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    System,
    Developer,
    Tool,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Developer => "developer",
            Role::Tool => "tool",
            Role::Other(s) => s,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "developer" => Role::Developer,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ToolCallStatus::Running),
            "completed" => Some(ToolCallStatus::Completed),
            "error" => Some(ToolCallStatus::Error),
            _ => None,
        }
    }
}

/// A tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub call_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_tool_use_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// A compacted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            timestamp: String::new(),
        }
    }
}

/// Body of `POST /agui/run`.
///
/// Messages are kept as raw JSON and forwarded to the runner untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAgentInput {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The minimal view of an input message the relay needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl InputMessage {
    pub fn is_hidden(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("hidden"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_str().filter(|s| !s.is_empty())
    }
}

impl RunAgentInput {
    /// Decode the messages that parse as chat messages; others are skipped.
    pub fn input_messages(&self) -> Vec<InputMessage> {
        self.messages
            .iter()
            .filter_map(|m| serde_json::from_value(m.clone()).ok())
            .collect()
    }
}
