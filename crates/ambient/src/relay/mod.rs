//! Client-facing relay between browsers, the event log and session runners.

mod activity;
mod display_name;
mod error;
mod service;

use serde::{Deserialize, Serialize};

pub use activity::{ACTIVITY_DEBOUNCE_SECS, ActivityTracker};
pub use display_name::{
    DisplayNameGenerator, DisplayNameQueue, DisplayNameRequest, PromptTitleGenerator,
    derive_title,
};
pub use error::{RelayError, RelayResult};
pub use service::{ClientStream, FeedbackOutcome, Relay, ReplayMode};

/// A session addressed by project and session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub project: String,
    pub session: String,
}

impl SessionRef {
    pub fn new(project: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            session: session.into(),
        }
    }
}

/// Relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interval of SSE comment heartbeats while tailing a live run.
    pub heartbeat_secs: u64,
    /// Per-viewer live buffer, in lines.
    pub live_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            live_buffer: crate::live::DEFAULT_BUFFER,
        }
    }
}
