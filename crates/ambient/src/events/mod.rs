//! Durable per-session event log.
//!
//! One newline-delimited JSON file per session, append-only. Readers always
//! observe a prefix of what has been written; a trailing partial line is
//! ignored by readers and repaired by the next writer.

mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{EVENTS_FILE, EventLog, LEGACY_FILE, LogSnapshot, validate_session_id};
