//! Recovery Pre-Pass (spec §4.M): before execution, walk the prior
//! manifest's succeeded artifacts and verify each one's blob still exists
//! on disk. A missing blob is rewritten as a `failed` event with
//! diagnostic `recovery_missing_blob`, so the Planner sees it as dirty on
//! the very next diff.
#![deny(unsafe_code)]

use chrono::Utc;
use mge_blob::{BlobError, BlobStore};
use mge_core::{ArtifactEvent, ArtifactOutput, ArtifactStatus, CanonicalId, Manifest};
use mge_eventlog::{EventLog, EventLogError};
use mge_storage::StorageBackend;
use serde_json::json;

/// Errors raised while running the recovery pre-pass.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Summary of one pre-pass run (spec §4.M), joined into the plan
/// explanation shown to the user.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RecoveryPrepassSummary {
    pub checked_artifact_ids: Vec<CanonicalId>,
    pub recovered_artifact_ids: Vec<CanonicalId>,
    pub pending_artifact_ids: Vec<CanonicalId>,
    pub failed_artifact_ids: Vec<CanonicalId>,
    pub failed_recoveries: Vec<CanonicalId>,
}

/// Walk every `succeeded` artifact in `manifest`, verify its blob exists,
/// and append a `failed` event with `recovery_missing_blob` diagnostics
/// for any that don't.
///
/// # Errors
///
/// Propagates event-log append or blob-existence-check failures. A single
/// artifact failing its existence check is recorded in the summary, not
/// returned as an error — only infrastructure failures (I/O, serialization)
/// surface as `Err`.
pub async fn run_prepass<B: StorageBackend>(
    manifest: &Manifest,
    event_log: &EventLog<'_, B>,
    blob_store: &BlobStore<'_, B>,
) -> Result<RecoveryPrepassSummary, RecoveryError> {
    let mut summary = RecoveryPrepassSummary::default();

    for (artifact_id, entry) in &manifest.artefacts {
        match entry.status {
            ArtifactStatus::Succeeded => {
                summary.checked_artifact_ids.push(artifact_id.clone());
                let Some(hash) = &entry.hash else {
                    summary.pending_artifact_ids.push(artifact_id.clone());
                    continue;
                };
                match blob_store.exists(hash).await {
                    Ok(true) => summary.pending_artifact_ids.push(artifact_id.clone()),
                    Ok(false) => {
                        let event = ArtifactEvent {
                            artifact_id: artifact_id.clone(),
                            revision: manifest.revision,
                            inputs_hash: entry.inputs_hash.clone(),
                            output: ArtifactOutput::default(),
                            status: ArtifactStatus::Failed,
                            produced_by: entry.produced_by.clone(),
                            diagnostics: Some(json!({"reason": "recovery_missing_blob"})),
                            created_at: Utc::now(),
                        };
                        match event_log.append_artefact(&event).await {
                            Ok(()) => summary.recovered_artifact_ids.push(artifact_id.clone()),
                            Err(_) => summary.failed_recoveries.push(artifact_id.clone()),
                        }
                    }
                    Err(_) => summary.failed_recoveries.push(artifact_id.clone()),
                }
            }
            ArtifactStatus::Failed => summary.failed_artifact_ids.push(artifact_id.clone()),
            ArtifactStatus::Skipped => {}
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mge_blob::BlobPayload;
    use mge_core::{ArtefactEntry, Revision};
    use mge_storage::MemoryBackend;
    use std::collections::BTreeMap;

    fn entry(hash: &str, produced_by: &str) -> ArtefactEntry {
        ArtefactEntry {
            hash: Some(hash.to_string()),
            blob: None,
            produced_by: produced_by.to_string(),
            status: ArtifactStatus::Succeeded,
            inputs_hash: "h".to_string(),
            created_at: Utc::now(),
            diagnostics: None,
        }
    }

    #[tokio::test]
    async fn missing_blob_is_rewritten_failed_and_reported_recovered() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let log = EventLog::new(&storage);
        let blobs = BlobStore::new(&storage);

        let artifact_id: CanonicalId = "Artifact:Script.Out".parse().unwrap();
        let mut artefacts = BTreeMap::new();
        artefacts.insert(artifact_id.clone(), entry("deadbeef", "Producer:Script"));
        let manifest = Manifest {
            revision: Revision::FIRST,
            inputs: BTreeMap::new(),
            artefacts,
            created_at: Utc::now(),
        };

        let summary = run_prepass(&manifest, &log, &blobs).await.unwrap();
        assert_eq!(summary.recovered_artifact_ids, vec![artifact_id.clone()]);
        assert!(summary.pending_artifact_ids.is_empty());

        let events = log.read_artefact_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn present_blob_is_left_pending_with_no_event_appended() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let log = EventLog::new(&storage);
        let blobs = BlobStore::new(&storage);

        let blob_ref = blobs.put(BlobPayload::bytes(b"content".to_vec())).await.unwrap();
        let artifact_id: CanonicalId = "Artifact:Script.Out".parse().unwrap();
        let mut artefacts = BTreeMap::new();
        artefacts.insert(artifact_id.clone(), entry(&blob_ref.hash, "Producer:Script"));
        let manifest = Manifest {
            revision: Revision::FIRST,
            inputs: BTreeMap::new(),
            artefacts,
            created_at: Utc::now(),
        };

        let summary = run_prepass(&manifest, &log, &blobs).await.unwrap();
        assert_eq!(summary.pending_artifact_ids, vec![artifact_id]);
        assert!(summary.recovered_artifact_ids.is_empty());
        assert!(log.read_artefact_events().await.unwrap().is_empty());
    }
}
