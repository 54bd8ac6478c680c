//! JSONL-backed event log.

use std::io::{BufRead, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{StoreError, StoreResult};
use crate::agui::{Event, RunIds};

/// Per-session event file name.
pub const EVENTS_FILE: &str = "agui-events.jsonl";

/// Per-session legacy message log file name.
pub const LEGACY_FILE: &str = "messages.json";

/// Events read from a session log plus the number of complete lines consumed.
///
/// `cursor` is the sequence number the next appended event will receive, as
/// seen at read time. Live lines with `seq < cursor` are already contained in
/// `events` (or were corrupt and skipped).
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    pub events: Vec<Event>,
    pub cursor: u64,
}

/// Writer state for one session, guarded by that session's mutex.
#[derive(Debug, Default)]
struct SessionWriter {
    /// Sequence number of the next line; `None` until the file has been scanned.
    next_seq: Option<u64>,
}

/// Append-only per-session event store.
#[derive(Debug)]
pub struct EventLog {
    /// Directory holding one subdirectory per session.
    sessions_dir: PathBuf,
    writers: DashMap<String, Arc<Mutex<SessionWriter>>>,
}

impl EventLog {
    /// Create a log rooted at `<state_dir>/sessions`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: state_dir.as_ref().join("sessions"),
            writers: DashMap::new(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn session_dir(&self, session: &str) -> StoreResult<PathBuf> {
        validate_session_id(session)?;
        Ok(self.sessions_dir.join(session))
    }

    pub fn events_path(&self, session: &str) -> StoreResult<PathBuf> {
        Ok(self.session_dir(session)?.join(EVENTS_FILE))
    }

    pub fn legacy_path(&self, session: &str) -> StoreResult<PathBuf> {
        Ok(self.session_dir(session)?.join(LEGACY_FILE))
    }

    /// Append one event, filling `threadId`/`runId` where missing.
    ///
    /// Returns the event's sequence number (its 0-based line index).
    pub async fn append(&self, session: &str, event: &Event, ids: &RunIds) -> StoreResult<u64> {
        let path = self.events_path(session)?;

        let mut event = event.clone();
        event.fill_run_ids(ids);
        let mut record = event.to_json();
        record.push('\n');

        let writer = self
            .writers
            .entry(session.to_string())
            .or_default()
            .clone();
        let mut writer = writer.lock().await;

        let result = write_record(&path, &mut writer, record.as_bytes()).await;
        if result.is_err() {
            // Force a rescan; the file may hold a partial record now.
            writer.next_seq = None;
        }
        result
    }

    /// Load every parseable event of a session in append order.
    pub async fn load(&self, session: &str) -> StoreResult<Vec<Event>> {
        Ok(self.load_snapshot(session).await?.events)
    }

    /// Load every parseable event plus the read cursor.
    ///
    /// A missing file is an empty log. Corrupt lines are skipped with a
    /// warning but still advance the cursor.
    pub async fn load_snapshot(&self, session: &str) -> StoreResult<LogSnapshot> {
        let path = self.events_path(session)?;
        tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Forget the cached writer state of a session nobody is appending to.
    ///
    /// The next append rescans the file. Returns whether anything was dropped.
    pub fn release(&self, session: &str) -> bool {
        self.writers
            .remove_if(session, |_, writer| Arc::strong_count(writer) == 1)
            .is_some()
    }

    /// Number of sessions with cached writer state.
    pub fn open_writers(&self) -> usize {
        self.writers.len()
    }

    /// Whether the session has a log file at all.
    pub async fn exists(&self, session: &str) -> StoreResult<bool> {
        let path = self.events_path(session)?;
        Ok(fs::try_exists(&path).await?)
    }
}

async fn write_record(path: &Path, writer: &mut SessionWriter, record: &[u8]) -> StoreResult<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .await?;

    let seq = match writer.next_seq {
        Some(seq) => seq,
        None => scan_and_repair(&mut file, path).await?,
    };

    file.write_all(record).await?;
    file.flush().await?;

    writer.next_seq = Some(seq + 1);
    Ok(seq)
}

/// Count complete lines and terminate a dangling partial line.
async fn scan_and_repair(file: &mut fs::File, path: &Path) -> StoreResult<u64> {
    file.seek(std::io::SeekFrom::Start(0)).await?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await?;

    let mut lines = contents.iter().filter(|b| **b == b'\n').count() as u64;
    if contents.last().is_some_and(|b| *b != b'\n') {
        warn!(
            "Repairing unterminated record at end of {}",
            path.display()
        );
        file.write_all(b"\n").await?;
        lines += 1;
    }
    debug!("Event log {} holds {} lines", path.display(), lines);
    Ok(lines)
}

fn read_snapshot(path: &Path) -> StoreResult<LogSnapshot> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LogSnapshot::default()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut snapshot = LogSnapshot::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            // Write still in progress; not part of the readable prefix.
            debug!("Ignoring unterminated trailing record in {}", path.display());
            break;
        }
        let line_no = snapshot.cursor;
        snapshot.cursor += 1;

        let line = &buf[..buf.len() - 1];
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match Event::from_slice(line) {
            Ok(event) => snapshot.events.push(event),
            Err(err) => {
                warn!(
                    "Skipping malformed event at {}:{}: {}",
                    path.display(),
                    line_no + 1,
                    err
                );
            }
        }
    }

    Ok(snapshot)
}

/// Reject ids that could escape the sessions directory.
pub fn validate_session_id(session: &str) -> StoreResult<()> {
    let valid = !session.is_empty()
        && session.len() <= 255
        && session != "."
        && !session.contains("..")
        && !session.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSession(session.to_string()))
    }
}
