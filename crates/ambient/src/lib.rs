//! Ambient session backend library.
//!
//! Relays AG-UI runs between browsers and per-session runners, keeps the
//! durable event log, and compacts it into message history.

pub mod agui;
pub mod api;
pub mod auth;
pub mod compaction;
pub mod events;
pub mod live;
pub mod migration;
pub mod relay;
pub mod runner;

pub use agui::{Event, EventType, Message};
pub use compaction::{MessageCompactor, compact_events};
pub use events::EventLog;
pub use live::LiveHub;
pub use migration::{LegacyMigrator, Migration};
pub use relay::{Relay, RelayConfig, SessionRef};
pub use runner::{RunnerClient, RunnerConfig};
