//! `text/event-stream` framing.

use super::types::Event;

pub const DATA_PREFIX: &str = "data:";
pub const HEARTBEAT: &str = ": heartbeat\n\n";

/// Frame an event as a single SSE `data:` record.
pub fn frame(event: &Event) -> String {
    format!("data: {}\n\n", event.to_json())
}

/// Extract the JSON payload of a `data:` line. Returns `None` for comments,
/// blank lines, other SSE fields and `[DONE]` sentinels.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(DATA_PREFIX)?;
    let payload = rest.strip_prefix(' ').unwrap_or(rest);
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

/// Decode the event carried by a `data:` line.
pub fn parse_data_line(line: &str) -> Option<Event> {
    data_payload(line).and_then(|payload| Event::from_json(payload).ok())
}

/// Whether a framed line carries an event that ends a run.
pub fn is_terminal_frame(line: &str) -> bool {
    parse_data_line(line)
        .and_then(|event| event.event_type())
        .is_some_and(|ty| ty.is_run_terminal())
}
