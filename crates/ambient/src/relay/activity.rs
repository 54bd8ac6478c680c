//! Per-session last-activity tracking.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;

use crate::agui::EventType;

/// Minimum interval between recorded activity updates for one session.
pub const ACTIVITY_DEBOUNCE_SECS: i64 = 60;

/// Last activity per session.
///
/// Holds one timestamp for every session that has seen activity in this
/// process and never forgets it: the timestamp is what `/agui/activity`
/// reports, long after the session went quiet.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last: DashMap<String, DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for an event seen at `now`.
    ///
    /// Returns whether the stored timestamp changed. RUN_STARTED always
    /// updates; other activity events are debounced.
    pub fn observe(&self, session: &str, event_type: EventType, now: DateTime<Utc>) -> bool {
        if !event_type.is_activity() {
            return false;
        }

        let debounce = Duration::seconds(ACTIVITY_DEBOUNCE_SECS);
        let updated = match self.last.entry(session.to_string()) {
            Entry::Occupied(mut last) => {
                let due = event_type == EventType::RunStarted || now - *last.get() >= debounce;
                if due {
                    last.insert(now);
                }
                due
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if updated {
            debug!("Activity recorded for session {} ({})", session, event_type);
        }
        updated
    }

    pub fn last_activity(&self, session: &str) -> Option<DateTime<Utc>> {
        self.last.get(session).map(|t| *t)
    }
}
