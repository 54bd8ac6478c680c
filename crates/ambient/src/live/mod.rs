//! In-process live fan-out of persisted protocol lines.

mod hub;

pub use hub::{DEFAULT_BUFFER, LiveHub, LiveLine, LiveSubscription, RunGuard};
