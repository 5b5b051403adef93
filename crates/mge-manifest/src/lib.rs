//! Manifest Service (spec §4.E): fold the event log into an immutable
//! [`Manifest`] per revision, write `revisions/<rev>.json`, and advance
//! `current.json` atomically.
#![deny(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mge_core::{ArtefactEntry, ArtifactEvent, CanonicalId, InputEntry, InputEvent, Manifest, Revision};
use mge_eventlog::{EventLog, EventLogError};
use mge_storage::{StorageBackend, StorageError, WriteOptions};
use serde::{Deserialize, Serialize};

const CURRENT_POINTER: &str = "current.json";

/// Errors raised while folding or persisting a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestBuildError {
    /// The event log could not be read.
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    /// The underlying storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Serializing or deserializing the manifest failed.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    /// Two events in the target revision claimed the same artifact ID with
    /// conflicting `produced_by` values — the log is inconsistent.
    #[error("conflicting producers for {artifact_id}: {first} vs {second}")]
    ConflictingProducer {
        /// The artifact ID both events claim to produce.
        artifact_id: CanonicalId,
        /// The `produced_by` of the earlier event.
        first: String,
        /// The `produced_by` of the later, conflicting event.
        second: String,
    },
    /// `current.json` exists but could not be parsed.
    #[error("current.json is corrupt: {0}")]
    CorruptPointer(String),
}

/// The `current.json` pointer: which revision is current and where its
/// manifest file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub revision: Revision,
    pub manifest_path: String,
}

/// Folds event logs into manifests and manages the `current.json` pointer.
pub struct ManifestService<'a, B: StorageBackend> {
    storage: &'a mge_storage::MovieStorage<B>,
}

impl<'a, B: StorageBackend> ManifestService<'a, B> {
    /// Build a manifest service scoped to `storage`'s movie.
    #[must_use]
    pub fn new(storage: &'a mge_storage::MovieStorage<B>) -> Self {
        Self { storage }
    }

    /// Read `current.json`, if it exists.
    pub async fn read_current_pointer(&self) -> Result<Option<CurrentPointer>, ManifestBuildError> {
        match self.storage.read_string(CURRENT_POINTER).await {
            Ok(raw) => {
                let pointer: CurrentPointer = serde_json::from_str(&raw)
                    .map_err(|e| ManifestBuildError::CorruptPointer(e.to_string()))?;
                Ok(Some(pointer))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// Load the manifest `current.json` points to, or `None` for a fresh
    /// workspace.
    pub async fn load_current(&self) -> Result<Option<Manifest>, ManifestBuildError> {
        let Some(pointer) = self.read_current_pointer().await? else {
            return Ok(None);
        };
        self.load_revision(pointer.revision).await.map(Some)
    }

    /// Load the manifest stored for a specific revision.
    pub async fn load_revision(&self, revision: Revision) -> Result<Manifest, ManifestBuildError> {
        let path = revision_path(revision);
        let raw = self.storage.read_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Fold the event log into a [`Manifest`] for `target_revision`, write
    /// it to `revisions/<rev>.json`, and atomically advance `current.json`.
    ///
    /// Events with a `revision` greater than `target_revision` are not yet
    /// visible and are excluded from the fold, so a manifest can always be
    /// rebuilt for any past revision from the same log.
    pub async fn build_from_events(
        &self,
        target_revision: Revision,
        clock_now: DateTime<Utc>,
    ) -> Result<Manifest, ManifestBuildError> {
        let log = EventLog::new(self.storage);
        let input_events = log.read_input_events().await?;
        let artifact_events = log.read_artefact_events().await?;

        let manifest = fold(target_revision, clock_now, &input_events, &artifact_events)?;

        let path = revision_path(target_revision);
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        self.storage
            .write(&path, bytes, WriteOptions::default())
            .await?;

        let pointer = CurrentPointer {
            revision: target_revision,
            manifest_path: path,
        };
        let pointer_bytes = serde_json::to_vec_pretty(&pointer)?;
        self.storage
            .write_atomic(CURRENT_POINTER, pointer_bytes, WriteOptions::default())
            .await?;

        Ok(manifest)
    }
}

fn revision_path(revision: Revision) -> String {
    format!("revisions/{revision}.json")
}

/// Fold input and artifact events into a [`Manifest`], taking the latest
/// event per ID (spec §3 invariant 3). Pure function so it can be unit
/// tested and reused by `mge-recovery` without touching storage.
pub fn fold(
    target_revision: Revision,
    created_at: DateTime<Utc>,
    input_events: &[InputEvent],
    artifact_events: &[ArtifactEvent],
) -> Result<Manifest, ManifestBuildError> {
    let mut inputs: BTreeMap<CanonicalId, InputEntry> = BTreeMap::new();
    for event in input_events.iter().filter(|e| e.revision <= target_revision) {
        inputs.insert(event.input_id.clone(), InputEntry::from(event));
    }

    // Two different producers both claiming the same artifact ID at the
    // target revision indicates a miswired blueprint (two edges attributing
    // the same output); catch it before it silently folds to "last wins".
    let mut producers_at_target: BTreeMap<CanonicalId, String> = BTreeMap::new();
    for event in artifact_events
        .iter()
        .filter(|e| e.revision == target_revision)
    {
        if let Some(seen) = producers_at_target.get(&event.artifact_id) {
            if seen != &event.produced_by {
                return Err(ManifestBuildError::ConflictingProducer {
                    artifact_id: event.artifact_id.clone(),
                    first: seen.clone(),
                    second: event.produced_by.clone(),
                });
            }
        } else {
            producers_at_target.insert(event.artifact_id.clone(), event.produced_by.clone());
        }
    }

    let mut artefacts: BTreeMap<CanonicalId, ArtefactEntry> = BTreeMap::new();
    for event in artifact_events
        .iter()
        .filter(|e| e.revision <= target_revision)
    {
        artefacts.insert(event.artifact_id.clone(), ArtefactEntry::from(event));
    }

    Ok(Manifest {
        revision: target_revision,
        inputs,
        artefacts,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mge_core::{ArtifactOutput, ArtifactStatus};
    use mge_storage::MemoryBackend;

    fn input_event(id: &str, rev: u32) -> InputEvent {
        InputEvent {
            input_id: id.parse().unwrap(),
            revision: Revision::new(rev),
            payload_digest: format!("digest-{rev}"),
            blob: None,
            created_at: Utc::now(),
        }
    }

    fn artifact_event(id: &str, rev: u32, producer: &str, status: ArtifactStatus) -> ArtifactEvent {
        ArtifactEvent {
            artifact_id: id.parse().unwrap(),
            revision: Revision::new(rev),
            inputs_hash: format!("hash-{rev}"),
            output: ArtifactOutput::default(),
            status,
            produced_by: producer.to_string(),
            diagnostics: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fold_takes_latest_event_per_artifact_id() {
        let events = vec![
            artifact_event("Artifact:A.Out", 1, "job-1", ArtifactStatus::Succeeded),
            artifact_event("Artifact:A.Out", 2, "job-2", ArtifactStatus::Failed),
        ];
        let manifest = fold(Revision::new(2), Utc::now(), &[], &events).unwrap();
        let entry = manifest.artefacts.get(&"Artifact:A.Out".parse().unwrap()).unwrap();
        assert_eq!(entry.produced_by, "job-2");
        assert_eq!(entry.status, ArtifactStatus::Failed);
    }

    #[test]
    fn fold_rejects_conflicting_producers_at_target_revision() {
        let events = vec![
            artifact_event("Artifact:A.Out", 2, "job-x", ArtifactStatus::Succeeded),
            artifact_event("Artifact:A.Out", 2, "job-y", ArtifactStatus::Succeeded),
        ];
        let err = fold(Revision::new(2), Utc::now(), &[], &events).unwrap_err();
        assert!(matches!(err, ManifestBuildError::ConflictingProducer { .. }));
    }

    #[test]
    fn fold_excludes_events_past_target_revision() {
        let events = vec![artifact_event("Artifact:A.Out", 5, "job-5", ArtifactStatus::Succeeded)];
        let manifest = fold(Revision::new(2), Utc::now(), &[], &events).unwrap();
        assert!(manifest.artefacts.is_empty());
    }

    #[test]
    fn fold_is_reproducible_for_the_same_inputs() {
        let inputs = vec![input_event("Input:Prompt", 1)];
        let artifacts = vec![artifact_event("Artifact:A.Out", 1, "job-1", ArtifactStatus::Succeeded)];
        let now = Utc::now();
        let first = fold(Revision::new(1), now, &inputs, &artifacts).unwrap();
        let second = fold(Revision::new(1), now, &inputs, &artifacts).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn build_from_events_writes_manifest_and_advances_pointer() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let log = EventLog::new(&storage);
        log.append_input(&input_event("Input:Prompt", 1)).await.unwrap();
        log.append_artefact(&artifact_event("Artifact:A.Out", 1, "job-1", ArtifactStatus::Succeeded))
            .await
            .unwrap();

        let service = ManifestService::new(&storage);
        let manifest = service
            .build_from_events(Revision::new(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(manifest.artefacts.len(), 1);

        let pointer = service.read_current_pointer().await.unwrap().unwrap();
        assert_eq!(pointer.revision, Revision::new(1));

        let loaded = service.load_current().await.unwrap().unwrap();
        assert_eq!(loaded.revision, manifest.revision);
        assert_eq!(loaded.artefacts.len(), 1);
    }

    #[tokio::test]
    async fn no_current_pointer_on_fresh_workspace() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let service = ManifestService::new(&storage);
        assert!(service.load_current().await.unwrap().is_none());
    }
}
