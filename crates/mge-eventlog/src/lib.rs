//! Append-only JSONL Event Log (spec §4.D): `events/inputs.log` and
//! `events/artefacts.log`. Writers append one JSON-encoded event per line;
//! readers parse line-by-line and tolerate a truncated trailing line (the
//! recovery pre-pass is responsible for detecting and repairing that case,
//! not the reader).
#![deny(unsafe_code)]

use mge_core::{ArtifactEvent, InputEvent};
use mge_storage::{ListOptions, StorageBackend, StorageError, WriteOptions};

const INPUTS_LOG: &str = "events/inputs.log";
const ARTEFACTS_LOG: &str = "events/artefacts.log";

/// Errors raised while appending to or reading an event log.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A non-trailing line failed to parse as JSON. A malformed trailing
    /// line is tolerated (see module docs); an interior one indicates log
    /// corruption and is fatal.
    #[error("malformed event log line {line_number} in {log}: {source}")]
    MalformedLine {
        /// Which log file (`events/inputs.log` or `events/artefacts.log`).
        log: &'static str,
        /// 1-indexed line number.
        line_number: usize,
        #[source]
        source: serde_json::Error,
    },
    /// An event failed to serialize before being appended.
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only JSONL event log for one movie, scoped to a [`mge_storage::MovieStorage`].
pub struct EventLog<'a, B: StorageBackend> {
    storage: &'a mge_storage::MovieStorage<B>,
}

impl<'a, B: StorageBackend> EventLog<'a, B> {
    /// Build an event log scoped to `storage`'s movie.
    #[must_use]
    pub fn new(storage: &'a mge_storage::MovieStorage<B>) -> Self {
        Self { storage }
    }

    /// Append one [`InputEvent`] as a single JSONL line.
    pub async fn append_input(&self, event: &InputEvent) -> Result<(), EventLogError> {
        self.append_line(INPUTS_LOG, event).await
    }

    /// Append one [`ArtifactEvent`] as a single JSONL line.
    pub async fn append_artefact(&self, event: &ArtifactEvent) -> Result<(), EventLogError> {
        self.append_line(ARTEFACTS_LOG, event).await
    }

    /// Read every well-formed [`InputEvent`] in declaration order.
    pub async fn read_input_events(&self) -> Result<Vec<InputEvent>, EventLogError> {
        self.read_events(INPUTS_LOG).await
    }

    /// Read every well-formed [`ArtifactEvent`] in declaration order.
    ///
    /// Conceptually a lazy sequence per spec §4.D; in practice the log is
    /// small (one movie's worth of events) so this reads and parses it in
    /// one pass rather than exposing a true streaming iterator.
    pub async fn read_artefact_events(&self) -> Result<Vec<ArtifactEvent>, EventLogError> {
        self.read_events(ARTEFACTS_LOG).await
    }

    async fn append_line<T: serde::Serialize>(
        &self,
        log: &'static str,
        event: &T,
    ) -> Result<(), EventLogError> {
        let mut existing = match self.storage.read_bytes(log).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => Vec::new(),
            Err(other) => return Err(other.into()),
        };
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        existing.append(&mut line);
        self.storage
            .write(log, existing, WriteOptions::default())
            .await?;
        Ok(())
    }

    async fn read_events<T: serde::de::DeserializeOwned>(
        &self,
        log: &'static str,
    ) -> Result<Vec<T>, EventLogError> {
        let raw = match self.storage.read_string(log).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(Vec::new()),
            Err(other) => return Err(other.into()),
        };
        let lines: Vec<&str> = raw.lines().collect();
        let mut events = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    let is_last = idx + 1 == lines.len();
                    if is_last {
                        // A truncated trailing line — likely a crash mid-append.
                        // The recovery pre-pass reconciles this; readers just
                        // drop it.
                        break;
                    }
                    return Err(EventLogError::MalformedLine {
                        log,
                        line_number: idx + 1,
                        source: err,
                    });
                }
            }
        }
        Ok(events)
    }
}

/// `true` if `dir` under the movie's `events/` directory exists at all —
/// used by [`mge_recovery`] to distinguish "no runs yet" from "logs exist".
pub async fn events_dir_exists<B: StorageBackend>(
    storage: &mge_storage::MovieStorage<B>,
) -> Result<bool, EventLogError> {
    Ok(storage.directory_exists("events").await?
        || !storage
            .list("events", ListOptions::default())
            .await?
            .is_empty())
}
