//! Background display-name generation.
//!
//! The relay hands the first user prompt of a session to a worker task and
//! never waits for the result.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::SessionRef;

/// Queue depth of pending display-name requests.
pub const DISPLAY_NAME_QUEUE: usize = 64;

const MAX_TITLE_CHARS: usize = 60;

/// Sessions remembered for deduplication before the set is reset.
pub const MAX_REMEMBERED_SESSIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct DisplayNameRequest {
    pub session: SessionRef,
    pub prompt: String,
}

/// Produces and stores a human-readable session title.
#[async_trait]
pub trait DisplayNameGenerator: Send + Sync {
    async fn generate(&self, request: &DisplayNameRequest) -> anyhow::Result<String>;
}

/// Derives a title from the prompt's first line and logs it.
#[derive(Debug, Default)]
pub struct PromptTitleGenerator;

#[async_trait]
impl DisplayNameGenerator for PromptTitleGenerator {
    async fn generate(&self, request: &DisplayNameRequest) -> anyhow::Result<String> {
        let title = derive_title(&request.prompt);
        anyhow::ensure!(!title.is_empty(), "prompt has no text");
        info!(
            "Display name for {}/{}: {:?}",
            request.session.project, request.session.session, title
        );
        Ok(title)
    }
}

pub fn derive_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let words = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if words.chars().count() <= MAX_TITLE_CHARS {
        return words;
    }
    let mut title: String = words.chars().take(MAX_TITLE_CHARS).collect();
    if let Some(cut) = title.rfind(' ') {
        title.truncate(cut);
    }
    title.push_str("...");
    title
}

/// Sender side of the display-name worker.
#[derive(Clone)]
pub struct DisplayNameQueue {
    tx: mpsc::Sender<DisplayNameRequest>,
    requested: Arc<DashMap<String, ()>>,
}

impl DisplayNameQueue {
    /// Spawn the worker on the current runtime.
    pub fn spawn(generator: Arc<dyn DisplayNameGenerator>) -> Self {
        let (tx, mut rx) = mpsc::channel::<DisplayNameRequest>(DISPLAY_NAME_QUEUE);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(err) = generator.generate(&request).await {
                    warn!(
                        "Display name generation failed for session {}: {:#}",
                        request.session.session, err
                    );
                }
            }
            debug!("Display name worker stopped");
        });
        Self {
            tx,
            requested: Arc::new(DashMap::new()),
        }
    }

    /// Number of sessions currently remembered.
    pub fn remembered(&self) -> usize {
        self.requested.len()
    }

    /// Queue a request without waiting. Only the first prompt per session
    /// is accepted; returns whether it was queued.
    ///
    /// At most [`MAX_REMEMBERED_SESSIONS`] sessions are remembered.
    pub fn submit(&self, session: &SessionRef, prompt: &str) -> bool {
        if prompt.trim().is_empty() {
            return false;
        }
        let key = format!("{}/{}", session.project, session.session);
        if self.requested.len() >= MAX_REMEMBERED_SESSIONS && !self.requested.contains_key(&key) {
            // A forgotten session may get a second title; harmless.
            debug!("Display name dedupe set full, resetting");
            self.requested.clear();
        }
        if self.requested.insert(key.clone(), ()).is_some() {
            return false;
        }

        let request = DisplayNameRequest {
            session: session.clone(),
            prompt: prompt.to_string(),
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(err) => {
                warn!("Display name queue rejected session {}: {}", key, err);
                self.requested.remove(&key);
                false
            }
        }
    }
}
