//! Event-stream compaction into chat messages.
//!
//! [`MessageCompactor`] is a pure state machine over [`AguiEvent`]s. Feed it
//! events in log order and call [`MessageCompactor::into_messages`] once to
//! obtain the final, deduplicated message list.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use uuid::Uuid;

use crate::agui::{AguiEvent, Event, Message, RawPayload, Role, ToolCall, ToolCallStatus};

/// A tool call between TOOL_CALL_START and TOOL_CALL_END.
#[derive(Debug, Clone)]
struct ActiveToolCall {
    name: String,
    args: String,
    parent_tool_use_id: String,
}

#[derive(Debug, Default)]
pub struct MessageCompactor {
    messages: Vec<Message>,
    current: Option<Message>,
    active_tool_calls: HashMap<String, ActiveToolCall>,
    hidden: HashSet<String>,
}

impl MessageCompactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and apply one wire event.
    pub fn handle_event(&mut self, event: &Event) {
        self.handle(AguiEvent::decode(event));
    }

    /// Apply one decoded event.
    pub fn handle(&mut self, event: AguiEvent) {
        match event {
            AguiEvent::TextMessageStart { message_id, role } => {
                self.flush();
                let role = role.unwrap_or(Role::Assistant);
                debug!("TEXT_MESSAGE_START role={} id={}", role, message_id);
                self.current = Some(Message::new(message_id, role, String::new()));
            }
            AguiEvent::TextMessageContent { delta, .. } => match self.current.as_mut() {
                Some(current) => current.content.push_str(&delta),
                None => warn!("TEXT_MESSAGE_CONTENT without an open message"),
            },
            AguiEvent::TextMessageEnd { .. } => match self.current.as_ref() {
                Some(current) if current.role == Role::User => self.flush(),
                // Assistant messages stay open for trailing tool calls.
                Some(_) => {}
                None => warn!("TEXT_MESSAGE_END without an open message"),
            },
            AguiEvent::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_tool_use_id,
            } => {
                if tool_call_id.is_empty() {
                    warn!("TOOL_CALL_START without toolCallId");
                    return;
                }
                debug!("TOOL_CALL_START {} ({})", tool_call_name, tool_call_id);
                self.active_tool_calls.insert(
                    tool_call_id,
                    ActiveToolCall {
                        name: tool_call_name,
                        args: String::new(),
                        parent_tool_use_id,
                    },
                );
            }
            AguiEvent::ToolCallArgs {
                tool_call_id,
                delta,
            } => match self.active_tool_calls.get_mut(&tool_call_id) {
                Some(active) => active.args.push_str(&delta),
                None => warn!("TOOL_CALL_ARGS for unknown tool call {:?}", tool_call_id),
            },
            AguiEvent::ToolCallEnd {
                tool_call_id,
                result,
                error,
            } => self.finish_tool_call(tool_call_id, result, error),
            AguiEvent::Raw(RawPayload::MessageMetadata { message_id, hidden }) => {
                if hidden && !message_id.is_empty() {
                    debug!("Marking message {} hidden", message_id);
                    self.hidden.insert(message_id);
                }
            }
            AguiEvent::Raw(RawPayload::Message(message)) => {
                self.flush();
                self.messages.push(message);
            }
            AguiEvent::Raw(RawPayload::Opaque) => {}
            AguiEvent::MessagesSnapshot { messages } => {
                debug!("MESSAGES_SNAPSHOT with {} messages", messages.len());
                self.messages = messages;
                self.current = None;
                self.active_tool_calls.clear();
            }
            AguiEvent::RunStarted
            | AguiEvent::RunFinished
            | AguiEvent::RunError { .. }
            | AguiEvent::StepStarted
            | AguiEvent::StepFinished
            | AguiEvent::StateSnapshot
            | AguiEvent::StateDelta
            | AguiEvent::ActivitySnapshot
            | AguiEvent::ActivityDelta => {}
            AguiEvent::TextMessageChunk
            | AguiEvent::ToolCallChunk
            | AguiEvent::ToolCallResult
            | AguiEvent::Custom
            | AguiEvent::Meta => {}
            AguiEvent::Unknown { event_type } => {
                debug!("Compaction ignores unknown event type {:?}", event_type)
            }
        }
    }

    fn finish_tool_call(&mut self, tool_call_id: String, result: String, error: String) {
        let Some(active) = self.active_tool_calls.remove(&tool_call_id) else {
            warn!("TOOL_CALL_END for unknown tool call {:?}", tool_call_id);
            return;
        };

        let status = if error.is_empty() {
            ToolCallStatus::Completed
        } else {
            ToolCallStatus::Error
        };
        let call = ToolCall {
            id: tool_call_id,
            name: active.name,
            args: active.args,
            call_type: "function".to_string(),
            parent_tool_use_id: active.parent_tool_use_id,
            result,
            status,
            error,
        };

        match self.current.as_mut() {
            Some(current) if current.role == Role::Assistant => current.tool_calls.push(call),
            _ => {
                let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, call.id.as_bytes()).to_string();
                let mut message = Message::new(id, Role::Assistant, String::new());
                message.tool_calls.push(call);
                self.messages.push(message);
            }
        }
    }

    fn flush(&mut self) {
        if let Some(current) = self.current.take() {
            self.messages.push(current);
        }
    }

    /// Finish compaction and return visible messages in stream order.
    ///
    /// Tool calls that never saw TOOL_CALL_END are dropped; hidden messages
    /// are filtered regardless of where their marker appeared.
    pub fn into_messages(mut self) -> Vec<Message> {
        self.flush();

        if !self.active_tool_calls.is_empty() {
            warn!(
                "Discarding {} tool calls without TOOL_CALL_END",
                self.active_tool_calls.len()
            );
        }

        let hidden = self.hidden;
        let total = self.messages.len();
        let visible: Vec<Message> = self
            .messages
            .into_iter()
            .filter(|m| !hidden.contains(&m.id))
            .collect();
        if visible.len() < total {
            debug!("Filtered {} hidden messages", total - visible.len());
        }
        visible
    }
}

/// Compact a whole event sequence.
pub fn compact_events(events: &[Event]) -> Vec<Message> {
    let mut compactor = MessageCompactor::new();
    for event in events {
        compactor.handle_event(event);
    }
    let messages = compactor.into_messages();
    debug!(
        "Compacted {} events into {} messages",
        events.len(),
        messages.len()
    );
    messages
}
