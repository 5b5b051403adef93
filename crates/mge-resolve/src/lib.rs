//! Artifact Resolver (spec §4.L): given artifact IDs, walks the artifact
//! event log to find each one's most recent state, reads its blob, and
//! decodes the payload by MIME type for job input assembly.
#![deny(unsafe_code)]

use std::collections::BTreeMap;

use mge_blob::{BlobError, BlobStore};
use mge_core::{ArtifactStatus, CanonicalId};
use mge_eventlog::{EventLog, EventLogError};
use mge_storage::StorageBackend;

/// Errors raised while resolving artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    /// The blob's bytes were declared JSON but did not parse as JSON.
    #[error("artifact '{artifact_id}' blob declared application/json but failed to parse: {source}")]
    InvalidJson {
        artifact_id: String,
        #[source]
        source: serde_json::Error,
    },
    /// The blob's bytes were declared text but were not valid UTF-8.
    #[error("artifact '{artifact_id}' blob declared a text MIME type but was not valid UTF-8")]
    InvalidUtf8 { artifact_id: String },
}

/// A decoded artifact payload, dispatched by MIME type (spec §4.L).
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPayload {
    Json(serde_json::Value),
    Text(String),
    Binary { bytes: Vec<u8>, mime_type: Option<String> },
}

fn is_json_mime(mime_type: Option<&str>) -> bool {
    mime_type == Some("application/json")
}

fn is_text_mime(mime_type: Option<&str>) -> bool {
    matches!(mime_type, Some("text/plain") | Some("text/markdown"))
}

/// Resolve `artifact_ids` to their decoded payloads, reading only the most
/// recent `succeeded` event per artifact. Artifacts with no succeeded event
/// (never produced, or currently failed/skipped) are absent from the
/// result map — callers distinguish "absent" from "resolved" themselves.
///
/// # Errors
///
/// Propagates event-log and blob-store errors, and reports a decode
/// failure if a declared MIME type's bytes don't actually match it.
pub async fn resolve_artifacts_from_event_log<B: StorageBackend>(
    artifact_ids: &[CanonicalId],
    event_log: &EventLog<'_, B>,
    blob_store: &BlobStore<'_, B>,
) -> Result<BTreeMap<CanonicalId, ResolvedPayload>, ResolveError> {
    let events = event_log.read_artefact_events().await?;
    let mut result = BTreeMap::new();

    for artifact_id in artifact_ids {
        let Some(event) = events
            .iter()
            .rev()
            .find(|e| &e.artifact_id == artifact_id && e.status == ArtifactStatus::Succeeded)
        else {
            continue;
        };
        let Some(blob_ref) = &event.output.blob else {
            continue;
        };
        let bytes = blob_store.get(blob_ref).await?;
        let mime = blob_ref.mime_type.as_deref();

        let payload = if is_json_mime(mime) {
            let value = serde_json::from_slice(&bytes).map_err(|source| ResolveError::InvalidJson {
                artifact_id: artifact_id.to_string(),
                source,
            })?;
            ResolvedPayload::Json(value)
        } else if is_text_mime(mime) {
            let text = String::from_utf8(bytes).map_err(|_| ResolveError::InvalidUtf8 {
                artifact_id: artifact_id.to_string(),
            })?;
            ResolvedPayload::Text(text)
        } else {
            ResolvedPayload::Binary {
                bytes,
                mime_type: blob_ref.mime_type.clone(),
            }
        };
        result.insert(artifact_id.clone(), payload);
    }

    Ok(result)
}

/// Return the subset of `artifact_ids` whose most recent event is
/// `failed`.
///
/// # Errors
///
/// Propagates event-log read errors.
pub async fn find_failed_artifacts<B: StorageBackend>(
    artifact_ids: &[CanonicalId],
    event_log: &EventLog<'_, B>,
) -> Result<Vec<CanonicalId>, ResolveError> {
    let events = event_log.read_artefact_events().await?;
    let mut failed = Vec::new();
    for artifact_id in artifact_ids {
        if let Some(event) = events.iter().rev().find(|e| &e.artifact_id == artifact_id) {
            if event.status == ArtifactStatus::Failed {
                failed.push(artifact_id.clone());
            }
        }
    }
    Ok(failed)
}

/// Return a flat map of `artifactId -> blob_file_path` for direct streaming
/// to external renderers, bypassing in-process payload decoding entirely.
///
/// # Errors
///
/// Propagates event-log and blob-store errors.
pub async fn resolve_artifact_blob_paths<B: StorageBackend>(
    artifact_ids: &[CanonicalId],
    event_log: &EventLog<'_, B>,
    blob_store: &BlobStore<'_, B>,
) -> Result<BTreeMap<CanonicalId, String>, ResolveError> {
    let events = event_log.read_artefact_events().await?;
    let mut result = BTreeMap::new();
    for artifact_id in artifact_ids {
        let Some(event) = events
            .iter()
            .rev()
            .find(|e| &e.artifact_id == artifact_id && e.status == ArtifactStatus::Succeeded)
        else {
            continue;
        };
        let Some(blob_ref) = &event.output.blob else {
            continue;
        };
        let path = blob_store.blob_path(blob_ref).await?;
        result.insert(artifact_id.clone(), path);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mge_blob::BlobPayload;
    use mge_core::{ArtifactEvent, ArtifactOutput, Revision};
    use mge_storage::MemoryBackend;

    async fn setup() -> (
        mge_storage::MovieStorage<MemoryBackend>,
    ) {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        (storage,)
    }

    #[tokio::test]
    async fn resolves_json_payload_for_latest_succeeded_event() {
        let (storage,) = setup().await;
        let log = EventLog::new(&storage);
        let blobs = BlobStore::new(&storage);

        let blob_ref = blobs
            .put(BlobPayload::with_mime(br#"{"line":"hi"}"#.to_vec(), "application/json"))
            .await
            .unwrap();
        let artifact_id: CanonicalId = "Artifact:Script.NarrationScript".parse().unwrap();
        log.append_artefact(&ArtifactEvent {
            artifact_id: artifact_id.clone(),
            revision: Revision::FIRST,
            inputs_hash: "h".to_string(),
            output: ArtifactOutput { blob: Some(blob_ref) },
            status: ArtifactStatus::Succeeded,
            produced_by: "Producer:Script".to_string(),
            diagnostics: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let resolved = resolve_artifacts_from_event_log(&[artifact_id.clone()], &log, &blobs)
            .await
            .unwrap();
        match &resolved[&artifact_id] {
            ResolvedPayload::Json(v) => assert_eq!(v["line"], "hi"),
            other => panic!("expected Json, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uses_most_recent_event_not_first() {
        let (storage,) = setup().await;
        let log = EventLog::new(&storage);
        let blobs = BlobStore::new(&storage);
        let artifact_id: CanonicalId = "Artifact:Script.Out".parse().unwrap();

        let first_blob = blobs.put(BlobPayload::with_mime(b"{\"v\":1}".to_vec(), "application/json")).await.unwrap();
        let second_blob = blobs.put(BlobPayload::with_mime(b"{\"v\":2}".to_vec(), "application/json")).await.unwrap();

        for blob in [first_blob, second_blob] {
            log.append_artefact(&ArtifactEvent {
                artifact_id: artifact_id.clone(),
                revision: Revision::FIRST,
                inputs_hash: "h".to_string(),
                output: ArtifactOutput { blob: Some(blob) },
                status: ArtifactStatus::Succeeded,
                produced_by: "Producer:Script".to_string(),
                diagnostics: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let resolved = resolve_artifacts_from_event_log(&[artifact_id.clone()], &log, &blobs)
            .await
            .unwrap();
        match &resolved[&artifact_id] {
            ResolvedPayload::Json(v) => assert_eq!(v["v"], 2),
            other => panic!("expected Json, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_failed_artifacts_reports_only_failed_latest() {
        let (storage,) = setup().await;
        let log = EventLog::new(&storage);
        let artifact_id: CanonicalId = "Artifact:Audio.Out".parse().unwrap();
        log.append_artefact(&ArtifactEvent {
            artifact_id: artifact_id.clone(),
            revision: Revision::FIRST,
            inputs_hash: "h".to_string(),
            output: ArtifactOutput::default(),
            status: ArtifactStatus::Failed,
            produced_by: "Producer:Audio".to_string(),
            diagnostics: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let failed = find_failed_artifacts(&[artifact_id.clone()], &log).await.unwrap();
        assert_eq!(failed, vec![artifact_id]);
    }

    #[tokio::test]
    async fn resolve_blob_paths_returns_flat_path_map() {
        let (storage,) = setup().await;
        let log = EventLog::new(&storage);
        let blobs = BlobStore::new(&storage);
        let artifact_id: CanonicalId = "Artifact:Timeline.Out".parse().unwrap();
        let blob_ref = blobs
            .put(BlobPayload::with_mime(b"binarydata".to_vec(), "video/mp4"))
            .await
            .unwrap();
        log.append_artefact(&ArtifactEvent {
            artifact_id: artifact_id.clone(),
            revision: Revision::FIRST,
            inputs_hash: "h".to_string(),
            output: ArtifactOutput { blob: Some(blob_ref) },
            status: ArtifactStatus::Succeeded,
            produced_by: "Producer:Timeline".to_string(),
            diagnostics: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let paths = resolve_artifact_blob_paths(&[artifact_id.clone()], &log, &blobs).await.unwrap();
        assert!(paths[&artifact_id].ends_with(".mp4"));
    }
}
