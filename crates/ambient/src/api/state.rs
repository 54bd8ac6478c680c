//! Application state shared across handlers.

use std::path::Path;
use std::sync::Arc;

use crate::auth::{AccessReview, AuthConfig, StaticAccessReview};
use crate::events::EventLog;
use crate::live::LiveHub;
use crate::relay::{DisplayNameQueue, PromptTitleGenerator, Relay, RelayConfig};
use crate::runner::{RunnerClient, RunnerConfig, RunnerResult};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub access: Arc<dyn AccessReview>,
    /// Auth settings, used for CORS.
    pub auth: Arc<AuthConfig>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, access: Arc<dyn AccessReview>, auth: AuthConfig) -> Self {
        Self {
            relay,
            access,
            auth: Arc::new(auth),
        }
    }

    /// Wire up the relay stack over `state_dir`.
    ///
    /// Must be called inside a Tokio runtime (starts the display-name worker).
    pub fn from_settings(
        state_dir: &Path,
        relay: RelayConfig,
        runner: RunnerConfig,
        auth: AuthConfig,
    ) -> RunnerResult<Self> {
        let log = Arc::new(EventLog::new(state_dir));
        let hub = LiveHub::new(relay.live_buffer);
        let runner = RunnerClient::new(runner)?;
        let display_names = DisplayNameQueue::spawn(Arc::new(PromptTitleGenerator));
        let relay = Arc::new(Relay::new(log, hub, runner, display_names, relay));
        let access = Arc::new(StaticAccessReview::new(&auth));
        Ok(Self::new(relay, access, auth))
    }
}
