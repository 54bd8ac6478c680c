//! AG-UI protocol model: wire events, decode-time normalization and SSE framing.

pub mod decode;
pub mod sse;
pub mod types;

pub use decode::{AguiEvent, RawPayload, decode_message};
pub use types::{
    Event, EventType, InputMessage, Message, Role, RunAgentInput, RunIds, ToolCall,
    ToolCallStatus,
};
