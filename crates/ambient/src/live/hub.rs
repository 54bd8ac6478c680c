//! Per-session publish/subscribe hub.
//!
//! Subscribers get a bounded channel each. Publishing never blocks: a line
//! that does not fit a subscriber's buffer is dropped for that subscriber
//! and logged. The event log stays authoritative, so a reader that fell
//! behind recovers by reconnecting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default per-subscriber buffer.
pub const DEFAULT_BUFFER: usize = 256;

/// A framed SSE line tagged with its event log sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveLine {
    pub seq: u64,
    pub line: Arc<str>,
}

impl LiveLine {
    pub fn new(seq: u64, line: impl Into<Arc<str>>) -> Self {
        Self {
            seq,
            line: line.into(),
        }
    }
}

#[derive(Default)]
struct SessionEntry {
    subscribers: Vec<(u64, mpsc::Sender<LiveLine>)>,
    active_runs: usize,
}

impl SessionEntry {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.active_runs == 0
    }
}

struct HubInner {
    sessions: DashMap<String, SessionEntry>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Process-wide registry of live viewers, keyed by session id.
#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<HubInner>,
}

impl LiveHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a listener. Lines published after this returns are delivered.
    pub fn subscribe(&self, session: &str) -> LiveSubscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .sessions
            .entry(session.to_string())
            .or_default()
            .subscribers
            .push((id, tx));
        debug!("Live subscriber {} registered for session {}", id, session);

        LiveSubscription {
            hub: self.clone(),
            session: session.to_string(),
            id,
            rx,
            released: false,
        }
    }

    /// Deliver a line to every current subscriber of the session.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, session: &str, line: LiveLine) -> usize {
        // Clone the senders out so no shard lock is held during fan-out.
        let senders: Vec<(u64, mpsc::Sender<LiveLine>)> = match self.inner.sessions.get(session) {
            Some(entry) => entry.subscribers.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, tx) in senders {
            match tx.try_send(line.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Live subscriber {} of session {} is full, dropping seq {}",
                        id, session, line.seq
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Live subscriber {} of session {} already gone", id, session);
                }
            }
        }
        delivered
    }

    /// Mark a run active for the session until the guard is dropped.
    pub fn begin_run(&self, session: &str) -> RunGuard {
        self.inner
            .sessions
            .entry(session.to_string())
            .or_default()
            .active_runs += 1;
        RunGuard {
            hub: self.clone(),
            session: session.to_string(),
        }
    }

    pub fn is_run_active(&self, session: &str) -> bool {
        self.inner
            .sessions
            .get(session)
            .is_some_and(|entry| entry.active_runs > 0)
    }

    pub fn subscriber_count(&self, session: &str) -> usize {
        self.inner
            .sessions
            .get(session)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of sessions with a registry entry.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn unsubscribe(&self, session: &str, id: u64) {
        if let Some(mut entry) = self.inner.sessions.get_mut(session) {
            entry.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
        self.collect(session);
        debug!("Live subscriber {} released for session {}", id, session);
    }

    fn end_run(&self, session: &str) {
        if let Some(mut entry) = self.inner.sessions.get_mut(session) {
            entry.active_runs = entry.active_runs.saturating_sub(1);
        }
        self.collect(session);
    }

    // Clean up empty entries
    fn collect(&self, session: &str) {
        self.inner
            .sessions
            .remove_if(session, |_, entry| entry.is_idle());
    }
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

/// One viewer's handle into the hub. Unregisters on drop.
pub struct LiveSubscription {
    hub: LiveHub,
    session: String,
    id: u64,
    rx: mpsc::Receiver<LiveLine>,
    released: bool,
}

impl LiveSubscription {
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Wait for the next line. `None` once released.
    pub async fn recv(&mut self) -> Option<LiveLine> {
        if self.released {
            return None;
        }
        self.rx.recv().await
    }

    /// Take an already-buffered line without waiting.
    pub fn try_recv(&mut self) -> Option<LiveLine> {
        self.rx.try_recv().ok()
    }

    /// Unregister from the hub. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.hub.unsubscribe(&self.session, self.id);
        self.rx.close();
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Active-run marker returned by [`LiveHub::begin_run`].
pub struct RunGuard {
    hub: LiveHub,
    session: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.hub.end_run(&self.session);
    }
}
