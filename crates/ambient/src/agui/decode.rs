//! Decode-time normalization of AG-UI events.
//!
//! Producers disagree on field spelling (`toolCallId` vs `tool_call_id`,
//! RAW payloads under `event` or `data`, nested `function` objects in tool
//! calls). Everything is folded into [`AguiEvent`] here so the compactor
//! only ever sees one canonical shape.

use serde_json::{Map, Value};

use super::types::{Event, EventType, Message, Role, ToolCall, ToolCallStatus};

const MESSAGE_ID_KEYS: &[&str] = &["messageId", "message_id"];
const TOOL_CALL_ID_KEYS: &[&str] = &["toolCallId", "tool_call_id"];
const TOOL_CALL_NAME_KEYS: &[&str] = &["toolCallName", "tool_call_name"];
const PARENT_TOOL_KEYS: &[&str] = &[
    "parentToolUseId",
    "parentToolUseID",
    "parent_tool_use_id",
    "parent_tool_call_id",
    "parentMessageId",
];

/// Canonical, typed view of one event.
#[derive(Debug, Clone, PartialEq)]
pub enum AguiEvent {
    RunStarted,
    RunFinished,
    RunError { message: String },
    StepStarted,
    StepFinished,
    TextMessageStart { message_id: String, role: Option<Role> },
    TextMessageContent { message_id: String, delta: String },
    TextMessageEnd { message_id: String },
    TextMessageChunk,
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        parent_tool_use_id: String,
    },
    ToolCallArgs { tool_call_id: String, delta: String },
    ToolCallEnd {
        tool_call_id: String,
        result: String,
        error: String,
    },
    ToolCallChunk,
    ToolCallResult,
    StateSnapshot,
    StateDelta,
    ActivitySnapshot,
    ActivityDelta,
    MessagesSnapshot { messages: Vec<Message> },
    Raw(RawPayload),
    Custom,
    Meta,
    /// A `type` this build does not know about, or no `type` at all.
    Unknown { event_type: String },
}

/// Interpretation of a RAW event's embedded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// `message_metadata` marker for a message.
    MessageMetadata { message_id: String, hidden: bool },
    /// A complete message carried out of band.
    Message(Message),
    /// Anything else (feedback acknowledgements and the like).
    Opaque,
}

impl AguiEvent {
    pub fn decode(event: &Event) -> Self {
        let fields = event.fields();
        let Some(event_type) = event.event_type() else {
            return AguiEvent::Unknown {
                event_type: event.type_str().unwrap_or_default().to_string(),
            };
        };

        match event_type {
            EventType::RunStarted => AguiEvent::RunStarted,
            EventType::RunFinished => AguiEvent::RunFinished,
            EventType::RunError => AguiEvent::RunError {
                message: string_of(fields, &["message", "error"]),
            },
            EventType::StepStarted => AguiEvent::StepStarted,
            EventType::StepFinished => AguiEvent::StepFinished,
            EventType::TextMessageStart => AguiEvent::TextMessageStart {
                message_id: string_of(fields, MESSAGE_ID_KEYS),
                role: first_str(fields, &["role"])
                    .filter(|r| !r.is_empty())
                    .map(Role::from),
            },
            EventType::TextMessageContent => AguiEvent::TextMessageContent {
                message_id: string_of(fields, MESSAGE_ID_KEYS),
                delta: string_of(fields, &["delta"]),
            },
            EventType::TextMessageEnd => AguiEvent::TextMessageEnd {
                message_id: string_of(fields, MESSAGE_ID_KEYS),
            },
            EventType::TextMessageChunk => AguiEvent::TextMessageChunk,
            EventType::ToolCallStart => AguiEvent::ToolCallStart {
                tool_call_id: string_of(fields, TOOL_CALL_ID_KEYS),
                tool_call_name: string_of(fields, TOOL_CALL_NAME_KEYS),
                parent_tool_use_id: string_of(fields, PARENT_TOOL_KEYS),
            },
            EventType::ToolCallArgs => AguiEvent::ToolCallArgs {
                tool_call_id: string_of(fields, TOOL_CALL_ID_KEYS),
                delta: string_of(fields, &["delta"]),
            },
            EventType::ToolCallEnd => AguiEvent::ToolCallEnd {
                tool_call_id: string_of(fields, TOOL_CALL_ID_KEYS),
                result: text_of(fields.get("result")),
                error: text_of(fields.get("error")),
            },
            EventType::ToolCallChunk => AguiEvent::ToolCallChunk,
            EventType::ToolCallResult => AguiEvent::ToolCallResult,
            EventType::StateSnapshot => AguiEvent::StateSnapshot,
            EventType::StateDelta => AguiEvent::StateDelta,
            EventType::ActivitySnapshot => AguiEvent::ActivitySnapshot,
            EventType::ActivityDelta => AguiEvent::ActivityDelta,
            EventType::MessagesSnapshot => AguiEvent::MessagesSnapshot {
                messages: fields
                    .get("messages")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(decode_message).collect())
                    .unwrap_or_default(),
            },
            EventType::Raw => AguiEvent::Raw(decode_raw(fields)),
            EventType::Custom => AguiEvent::Custom,
            EventType::Meta => AguiEvent::Meta,
        }
    }
}

fn decode_raw(fields: &Map<String, Value>) -> RawPayload {
    let Some(data) = fields
        .get("event")
        .and_then(Value::as_object)
        .or_else(|| fields.get("data").and_then(Value::as_object))
    else {
        return RawPayload::Opaque;
    };

    if data.get("type").and_then(Value::as_str) == Some("message_metadata") {
        return RawPayload::MessageMetadata {
            message_id: string_of(data, MESSAGE_ID_KEYS),
            hidden: data.get("hidden").and_then(Value::as_bool).unwrap_or(false),
        };
    }

    match first_str(data, &["role"]).filter(|r| !r.is_empty()) {
        Some(role) => RawPayload::Message(Message {
            id: string_of(data, &["id"]),
            role: Role::from(role),
            content: text_of(data.get("content")),
            tool_calls: Vec::new(),
            timestamp: timestamp_of(data.get("timestamp")),
        }),
        None => RawPayload::Opaque,
    }
}

/// Decode one message object from a snapshot. Non-objects are skipped.
pub fn decode_message(value: &Value) -> Option<Message> {
    let obj = value.as_object()?;
    let tool_calls = obj
        .get("toolCalls")
        .or_else(|| obj.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(decode_tool_call).collect())
        .unwrap_or_default();

    Some(Message {
        id: string_of(obj, &["id"]),
        role: first_str(obj, &["role"])
            .filter(|r| !r.is_empty())
            .map(Role::from)
            .unwrap_or(Role::Assistant),
        content: text_of(obj.get("content")),
        tool_calls,
        timestamp: timestamp_of(obj.get("timestamp")),
    })
}

fn decode_tool_call(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let function = obj.get("function").and_then(Value::as_object);

    let mut name = string_of(obj, &["name"]);
    let mut args = text_of(obj.get("args"));
    if let Some(function) = function {
        if name.is_empty() {
            name = string_of(function, &["name"]);
        }
        if args.is_empty() {
            args = text_of(function.get("arguments"));
        }
    }

    let error = text_of(obj.get("error"));
    let status = first_str(obj, &["status"])
        .and_then(ToolCallStatus::parse)
        .unwrap_or(if error.is_empty() {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Error
        });

    Some(ToolCall {
        id: string_of(obj, &["id"]),
        name,
        args,
        call_type: first_str(obj, &["type"])
            .filter(|t| !t.is_empty())
            .unwrap_or("function")
            .to_string(),
        parent_tool_use_id: string_of(obj, PARENT_TOOL_KEYS),
        result: text_of(obj.get("result")),
        status,
        error,
    })
}

/// First non-empty string among the given key spellings.
fn first_str<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| fields.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

fn string_of(fields: &Map<String, Value>, keys: &[&str]) -> String {
    first_str(fields, keys).unwrap_or_default().to_string()
}

/// Strings verbatim; other JSON values in their compact encoding; null as empty.
fn text_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn timestamp_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> Event {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_tool_call_start_accepts_snake_case() {
        let decoded = AguiEvent::decode(&event(json!({
            "type": "TOOL_CALL_START",
            "tool_call_id": "t1",
            "tool_call_name": "bash",
            "parent_tool_call_id": "p1"
        })));
        assert_eq!(
            decoded,
            AguiEvent::ToolCallStart {
                tool_call_id: "t1".to_string(),
                tool_call_name: "bash".to_string(),
                parent_tool_use_id: "p1".to_string(),
            }
        );
    }

    #[test]
    fn test_camel_case_wins_over_empty_snake_case() {
        let decoded = AguiEvent::decode(&event(json!({
            "type": "TOOL_CALL_ARGS",
            "toolCallId": "",
            "tool_call_id": "t2",
            "delta": "{}"
        })));
        assert_eq!(
            decoded,
            AguiEvent::ToolCallArgs {
                tool_call_id: "t2".to_string(),
                delta: "{}".to_string(),
            }
        );
    }

    #[test]
    fn test_raw_metadata_under_event_or_data() {
        for key in ["event", "data"] {
            let decoded = AguiEvent::decode(&event(json!({
                "type": "RAW",
                key: {"type": "message_metadata", "messageId": "m1", "hidden": true}
            })));
            assert_eq!(
                decoded,
                AguiEvent::Raw(RawPayload::MessageMetadata {
                    message_id: "m1".to_string(),
                    hidden: true,
                })
            );
        }
    }

    #[test]
    fn test_raw_message_payload() {
        let decoded = AguiEvent::decode(&event(json!({
            "type": "RAW",
            "event": {"role": "system", "id": "s1", "content": "note", "timestamp": 17}
        })));
        let AguiEvent::Raw(RawPayload::Message(msg)) = decoded else {
            panic!("expected raw message");
        };
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "note");
        assert_eq!(msg.timestamp, "17");
    }

    #[test]
    fn test_raw_without_payload_is_opaque() {
        let decoded = AguiEvent::decode(&event(json!({"type": "RAW", "source": "feedback"})));
        assert_eq!(decoded, AguiEvent::Raw(RawPayload::Opaque));
    }

    #[test]
    fn test_snapshot_tool_calls_in_function_form() {
        let decoded = AguiEvent::decode(&event(json!({
            "type": "MESSAGES_SNAPSHOT",
            "messages": [
                {"id": "a1", "role": "assistant", "content": "", "toolCalls": [
                    {"id": "t1", "type": "function", "function": {"name": "read", "arguments": "{\"p\":1}"}}
                ]},
                "not a message"
            ]
        })));
        let AguiEvent::MessagesSnapshot { messages } = decoded else {
            panic!("expected snapshot");
        };
        assert_eq!(messages.len(), 1);
        let call = &messages[0].tool_calls[0];
        assert_eq!(call.name, "read");
        assert_eq!(call.args, "{\"p\":1}");
        assert_eq!(call.status, ToolCallStatus::Completed);
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let decoded = AguiEvent::decode(&event(json!({"type": "THINKING_START"})));
        assert_eq!(
            decoded,
            AguiEvent::Unknown {
                event_type: "THINKING_START".to_string()
            }
        );
        let untyped = AguiEvent::decode(&event(json!({"delta": "x"})));
        assert_eq!(
            untyped,
            AguiEvent::Unknown {
                event_type: String::new()
            }
        );
    }

    #[test]
    fn test_tool_call_end_non_string_result() {
        let decoded = AguiEvent::decode(&event(json!({
            "type": "TOOL_CALL_END",
            "toolCallId": "t1",
            "result": {"ok": true}
        })));
        assert_eq!(
            decoded,
            AguiEvent::ToolCallEnd {
                tool_call_id: "t1".to_string(),
                result: "{\"ok\":true}".to_string(),
                error: String::new(),
            }
        );
    }
}
