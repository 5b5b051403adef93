//! Runner (spec §4.K, §5): executes an `ExecutionPlan` layer by layer.
//! Within a layer, jobs run concurrently under a semaphore; layers
//! themselves are a strict barrier — a layer never starts before the
//! previous one has fully drained. A job whose required artifact most
//! recently failed is short-circuited without touching a provider; a job
//! whose conditions are all unsatisfied (and has no unconditional input
//! left to run on) is skipped the same way.
#![deny(unsafe_code)]

pub mod cancel;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use mge_blob::{BlobError, BlobPayload, BlobStore};
use mge_condition::{ConditionError, ConditionNode};
use mge_core::{
    ArtifactEvent, ArtifactOutput, ArtifactStatus, CanonicalId, ExecutionPlan, IdKind,
    InputRecord, InputRecordKind, JobDescriptor, Revision,
};
use mge_eventlog::{EventLog, EventLogError};
use mge_provider::{BlobInput, InvokeRequest, ProviderError, ProviderRegistry};
use mge_resolve::{ResolveError, ResolvedPayload};
use mge_storage::{MovieStorage, StorageBackend, StorageError};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::warn;

use cancel::CancellationToken;

/// Errors raised while executing a plan. A single job failing is recorded
/// as a `failed` artifact event, not returned here — only infrastructure
/// failures (storage, serialization, malformed condition trees) surface as
/// `Err`.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Condition(#[from] ConditionError),
    #[error(transparent)]
    Hash(#[from] mge_core::HashError),
}

/// Tunables for one `execute_plan` call.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Maximum number of jobs run concurrently within a single layer.
    pub concurrency: usize,
    /// The provider environment (`"simulated"`, `"prod"`, ...) to resolve
    /// handlers under.
    pub environment: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            environment: "simulated".to_string(),
        }
    }
}

/// Terminal status of one job's attempt within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// What happened when the Runner drove one job to completion.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobOutcomeStatus,
    pub artefact_events: Vec<ArtifactEvent>,
}

/// Full accounting of one `execute_plan` call.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub job_outcomes: Vec<JobOutcome>,
    /// `true` if the run stopped early because the token was cancelled
    /// before every layer had run.
    pub cancelled: bool,
}

/// Execute every layer of `plan` in order, appending one artifact event per
/// declared output of every job attempted.
///
/// # Errors
///
/// Propagates event-log, blob-store, artifact-resolution, and
/// condition-parsing failures. A job's own failure (provider error,
/// upstream dependency failure, unsatisfied conditions) is recorded as a
/// `failed`/`skipped` event and does not stop the run.
pub async fn execute_plan<B: StorageBackend>(
    plan: &ExecutionPlan,
    resolved_inputs: &BTreeMap<String, Value>,
    storage: &MovieStorage<B>,
    registry: &ProviderRegistry,
    options: &RunnerOptions,
    token: &CancellationToken,
) -> Result<RunSummary, RunnerError> {
    let event_log = EventLog::new(storage);
    let blob_store = BlobStore::new(storage);
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));

    let mut summary = RunSummary::default();

    for layer in &plan.layers {
        if token.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        if layer.is_empty() {
            continue;
        }

        let outcomes = join_all(layer.iter().map(|job| {
            run_one_job(
                job,
                plan.revision,
                resolved_inputs,
                &event_log,
                &blob_store,
                registry,
                options,
                token,
                Arc::clone(&semaphore),
            )
        }))
        .await;

        for outcome in outcomes {
            summary.job_outcomes.push(outcome?);
        }

        if token.is_cancelled() {
            summary.cancelled = true;
            break;
        }
    }

    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn run_one_job<B: StorageBackend>(
    job: &JobDescriptor,
    revision: Revision,
    resolved_inputs: &BTreeMap<String, Value>,
    event_log: &EventLog<'_, B>,
    blob_store: &BlobStore<'_, B>,
    registry: &ProviderRegistry,
    options: &RunnerOptions,
    token: &CancellationToken,
    semaphore: Arc<Semaphore>,
) -> Result<JobOutcome, RunnerError> {
    let _permit = semaphore.acquire().await.expect("semaphore never closed");

    if token.is_cancelled() {
        let inputs_hash = compute_job_inputs_hash(job, resolved_inputs, &BTreeMap::new())?;
        let events = emit(job, revision, &inputs_hash, ArtifactStatus::Failed, json_reason("cancelled"));
        append_all(event_log, &events).await?;
        return Ok(JobOutcome {
            job_id: job.job_id.clone(),
            status: JobOutcomeStatus::Failed,
            artefact_events: events,
        });
    }

    let required_artifacts = gather_required_artifacts(job)?;

    let failed_upstream = mge_resolve::find_failed_artifacts(&required_artifacts, event_log).await?;
    if !failed_upstream.is_empty() {
        warn!(job_id = %job.job_id, failed = ?failed_upstream, "upstream artifact failed, short-circuiting");
        let inputs_hash = compute_job_inputs_hash(job, resolved_inputs, &BTreeMap::new())?;
        let diagnostics = serde_json::json!({
            "reason": "upstream_failure",
            "failedArtifacts": failed_upstream.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        let events = emit(job, revision, &inputs_hash, ArtifactStatus::Failed, diagnostics);
        append_all(event_log, &events).await?;
        return Ok(JobOutcome {
            job_id: job.job_id.clone(),
            status: JobOutcomeStatus::Failed,
            artefact_events: events,
        });
    }

    let resolved_artifacts =
        mge_resolve::resolve_artifacts_from_event_log(&required_artifacts, event_log, blob_store).await?;
    let inputs_hash = compute_job_inputs_hash(job, resolved_inputs, &resolved_artifacts)?;

    if !conditions_permit_run(job, resolved_inputs, &resolved_artifacts)? {
        let events = emit(job, revision, &inputs_hash, ArtifactStatus::Skipped, json_reason("conditions_not_met"));
        append_all(event_log, &events).await?;
        return Ok(JobOutcome {
            job_id: job.job_id.clone(),
            status: JobOutcomeStatus::Skipped,
            artefact_events: events,
        });
    }

    let Some(mapping) = &job.context.provider_mapping else {
        let events = emit(job, revision, &inputs_hash, ArtifactStatus::Failed, json_reason("no_provider_mapping"));
        append_all(event_log, &events).await?;
        return Ok(JobOutcome {
            job_id: job.job_id.clone(),
            status: JobOutcomeStatus::Failed,
            artefact_events: events,
        });
    };

    let handler = match registry.resolve(&mapping.provider, &mapping.model, &options.environment) {
        Ok(handler) => handler,
        Err(err) => {
            let diagnostics = serde_json::json!({"reason": "no_provider_handler", "detail": err.to_string()});
            let events = emit(job, revision, &inputs_hash, ArtifactStatus::Failed, diagnostics);
            append_all(event_log, &events).await?;
            return Ok(JobOutcome {
                job_id: job.job_id.clone(),
                status: JobOutcomeStatus::Failed,
                artefact_events: events,
            });
        }
    };

    let mut context = job.context.clone();
    context.extras.insert("assetBlobPaths".to_string(), asset_blob_paths_value(&required_artifacts, event_log, blob_store).await?);
    context
        .extras
        .insert("resolvedArtifacts".to_string(), resolved_artifacts_value(&resolved_artifacts));

    let request = InvokeRequest {
        job_id: job.job_id.clone(),
        producer_alias: job.producer.clone(),
        provider: mapping.provider.clone(),
        model: mapping.model.clone(),
        revision: revision.to_string(),
        layer_index: 0,
        attempt: 1,
        inputs: job.inputs.clone(),
        produces: job.produces.clone(),
        context,
    };

    let cancel_notify = Arc::new(tokio::sync::Notify::new());
    let watcher_token = token.clone();
    let watcher_notify = Arc::clone(&cancel_notify);
    tokio::spawn(async move {
        watcher_token.cancelled().await;
        watcher_notify.notify_waiters();
    });

    let response = match handler.invoke(request, cancel_notify).await {
        Ok(response) => response,
        Err(ProviderError::Invocation { message, provider, model, provider_request_id, recoverable }) => {
            let diagnostics = serde_json::json!({
                "reason": "provider_invocation_failed",
                "message": message,
                "provider": provider,
                "model": model,
                "providerRequestId": provider_request_id,
                "recoverable": recoverable,
            });
            let events = emit(job, revision, &inputs_hash, ArtifactStatus::Failed, diagnostics);
            append_all(event_log, &events).await?;
            return Ok(JobOutcome {
                job_id: job.job_id.clone(),
                status: JobOutcomeStatus::Failed,
                artefact_events: events,
            });
        }
        Err(ProviderError::NoHandler { provider, model, environment }) => {
            let diagnostics = serde_json::json!({"reason": "no_provider_handler", "provider": provider, "model": model, "environment": environment});
            let events = emit(job, revision, &inputs_hash, ArtifactStatus::Failed, diagnostics);
            append_all(event_log, &events).await?;
            return Ok(JobOutcome {
                job_id: job.job_id.clone(),
                status: JobOutcomeStatus::Failed,
                artefact_events: events,
            });
        }
    };

    let mut events = Vec::with_capacity(response.artefacts.len());
    let mut any_failed = false;
    for artefact in response.artefacts {
        let blob_ref = match artefact.blob {
            Some(BlobInput::Bytes { bytes, mime_type }) => {
                Some(blob_store.put(BlobPayload::with_mime(bytes, mime_type)).await?)
            }
            Some(BlobInput::Path { path, mime_type }) => {
                let bytes = tokio::fs::read(&path).await.map_err(|source| {
                    BlobError::Storage(StorageError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                })?;
                Some(blob_store.put(BlobPayload::with_mime(bytes, mime_type)).await?)
            }
            None => None,
        };
        any_failed |= artefact.status == ArtifactStatus::Failed;
        events.push(ArtifactEvent {
            artifact_id: artefact.artefact_id,
            revision,
            inputs_hash: inputs_hash.clone(),
            output: ArtifactOutput { blob: blob_ref },
            status: artefact.status,
            produced_by: job.job_id.clone(),
            diagnostics: artefact.diagnostics,
            created_at: Utc::now(),
        });
    }
    append_all(event_log, &events).await?;

    Ok(JobOutcome {
        job_id: job.job_id.clone(),
        status: if any_failed { JobOutcomeStatus::Failed } else { JobOutcomeStatus::Succeeded },
        artefact_events: events,
    })
}

fn json_reason(reason: &str) -> Value {
    serde_json::json!({ "reason": reason })
}

fn emit(
    job: &JobDescriptor,
    revision: Revision,
    inputs_hash: &str,
    status: ArtifactStatus,
    diagnostics: Value,
) -> Vec<ArtifactEvent> {
    job.produces
        .iter()
        .map(|id| ArtifactEvent {
            artifact_id: id.clone(),
            revision,
            inputs_hash: inputs_hash.to_string(),
            output: ArtifactOutput::default(),
            status,
            produced_by: job.job_id.clone(),
            diagnostics: Some(diagnostics.clone()),
            created_at: Utc::now(),
        })
        .collect()
}

async fn append_all<B: StorageBackend>(
    event_log: &EventLog<'_, B>,
    events: &[ArtifactEvent],
) -> Result<(), RunnerError> {
    for event in events {
        event_log.append_artefact(event).await?;
    }
    Ok(())
}

/// Every artifact a job needs resolved before it can run: its own
/// artifact-typed input bindings (fan-in aside), every fan-in member, and
/// any artifact referenced by one of its condition trees.
fn gather_required_artifacts(job: &JobDescriptor) -> Result<Vec<CanonicalId>, RunnerError> {
    let mut set: BTreeSet<CanonicalId> = BTreeSet::new();

    for (field, id) in &job.context.input_bindings {
        if id.kind() == IdKind::Artifact && !job.context.fan_in.contains_key(field) {
            set.insert(id.clone());
        }
    }
    for descriptor in job.context.fan_in.values() {
        for member in &descriptor.members {
            set.insert(member.id.clone());
        }
    }
    for raw in job.context.conditions.values() {
        let node = ConditionNode::parse(raw)?;
        for path in node.referenced_paths() {
            if path.starts_with("Inputs.") {
                continue;
            }
            if let Ok(id) = path.parse::<CanonicalId>() {
                if id.kind() == IdKind::Artifact {
                    set.insert(id);
                }
            }
        }
    }

    Ok(set.into_iter().collect())
}

/// Build the resolved-value map conditions are evaluated against: one entry
/// per free-standing input (keyed `Inputs.<name>`), one per resolved
/// artifact (keyed by its canonical id string).
fn condition_context(
    resolved_inputs: &BTreeMap<String, Value>,
    resolved_artifacts: &BTreeMap<CanonicalId, ResolvedPayload>,
) -> BTreeMap<String, Value> {
    let mut ctx: BTreeMap<String, Value> = BTreeMap::new();
    for (name, value) in resolved_inputs {
        ctx.insert(format!("Inputs.{name}"), value.clone());
    }
    for (id, payload) in resolved_artifacts {
        let value = match payload {
            ResolvedPayload::Json(v) => v.clone(),
            ResolvedPayload::Text(t) => Value::String(t.clone()),
            ResolvedPayload::Binary { mime_type, .. } => Value::String(mime_type.clone().unwrap_or_default()),
        };
        ctx.insert(id.to_string(), value);
    }
    ctx
}

/// `false` only when the job declares at least one condition, none of them
/// are satisfied, and every one of its input fields is conditionally gated
/// (no unconditional field remains to run on).
fn conditions_permit_run(
    job: &JobDescriptor,
    resolved_inputs: &BTreeMap<String, Value>,
    resolved_artifacts: &BTreeMap<CanonicalId, ResolvedPayload>,
) -> Result<bool, RunnerError> {
    if job.context.conditions.is_empty() {
        return Ok(true);
    }

    let ctx = condition_context(resolved_inputs, resolved_artifacts);
    let mut any_satisfied = false;
    for raw in job.context.conditions.values() {
        let node = ConditionNode::parse(raw)?;
        if node.evaluate(&ctx)? {
            any_satisfied = true;
        }
    }
    if any_satisfied {
        return Ok(true);
    }

    let has_unconditional_field = job
        .context
        .input_bindings
        .keys()
        .any(|field| !job.context.conditions.contains_key(field));
    Ok(has_unconditional_field)
}

/// Content-aware fingerprint of everything this job attempt depended on:
/// a sorted `InputRecord` list, hashed (spec §4.B/§4.J).
fn compute_job_inputs_hash(
    job: &JobDescriptor,
    resolved_inputs: &BTreeMap<String, Value>,
    resolved_artifacts: &BTreeMap<CanonicalId, ResolvedPayload>,
) -> Result<String, RunnerError> {
    let mut records: Vec<InputRecord> = Vec::new();

    for (field, input_id) in &job.context.input_bindings {
        if job.context.fan_in.contains_key(field) {
            continue;
        }
        let (kind, content_hash) = match input_id.kind() {
            IdKind::Input => {
                let name = if input_id.qname().contains('.') {
                    field.clone()
                } else {
                    input_id.qname().to_string()
                };
                let value = resolved_inputs.get(&name);
                (InputRecordKind::Scalar, mge_core::payload_digest(&value)?)
            }
            IdKind::Artifact => (InputRecordKind::Artifact, content_hash_of(resolved_artifacts.get(input_id))),
            IdKind::Producer => (InputRecordKind::Artifact, "n/a".to_string()),
        };
        records.push(InputRecord {
            id: input_id.clone(),
            kind,
            content_hash,
        });
    }

    for (field, descriptor) in &job.context.fan_in {
        let member_hashes: Vec<String> = descriptor
            .members
            .iter()
            .map(|member| content_hash_of(resolved_artifacts.get(&member.id)))
            .collect();
        let combined = mge_core::sha256_hex(member_hashes.join(",").as_bytes());
        let fan_in_id = job
            .context
            .input_bindings
            .get(field)
            .cloned()
            .unwrap_or_else(|| CanonicalId::new(IdKind::Artifact, field.clone(), vec![]));
        records.push(InputRecord {
            id: fan_in_id,
            kind: InputRecordKind::Fanin,
            content_hash: combined,
        });
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(mge_core::payload_digest(&records)?)
}

fn content_hash_of(payload: Option<&ResolvedPayload>) -> String {
    match payload {
        Some(ResolvedPayload::Json(v)) => mge_core::payload_digest(v).unwrap_or_else(|_| "unhashable".to_string()),
        Some(ResolvedPayload::Text(t)) => mge_core::sha256_hex(t.as_bytes()),
        Some(ResolvedPayload::Binary { bytes, .. }) => mge_core::sha256_hex(bytes),
        None => "absent".to_string(),
    }
}

async fn asset_blob_paths_value<B: StorageBackend>(
    required_artifacts: &[CanonicalId],
    event_log: &EventLog<'_, B>,
    blob_store: &BlobStore<'_, B>,
) -> Result<Value, RunnerError> {
    let paths = mge_resolve::resolve_artifact_blob_paths(required_artifacts, event_log, blob_store).await?;
    Ok(Value::Object(
        paths.into_iter().map(|(id, path)| (id.to_string(), Value::String(path))).collect(),
    ))
}

fn resolved_artifacts_value(resolved: &BTreeMap<CanonicalId, ResolvedPayload>) -> Value {
    Value::Object(
        resolved
            .iter()
            .filter_map(|(id, payload)| match payload {
                ResolvedPayload::Json(v) => Some((id.to_string(), v.clone())),
                ResolvedPayload::Text(t) => Some((id.to_string(), Value::String(t.clone()))),
                ResolvedPayload::Binary { .. } => None,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mge_core::{ArtifactStatus, ProducerJobContext, ProviderMapping};
    use mge_provider::{ArtefactResult, InvokeResponse, ProviderHandler, ProviderKey};
    use mge_storage::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn aid(kind: IdKind, qname: &str) -> CanonicalId {
        CanonicalId::new(kind, qname, vec![])
    }

    fn plain_job(job_id: &str, produces: Vec<CanonicalId>) -> JobDescriptor {
        JobDescriptor {
            job_id: job_id.to_string(),
            producer: job_id.trim_start_matches("Producer:").to_string(),
            inputs: vec![],
            produces,
            context: ProducerJobContext {
                namespace_path: job_id.trim_start_matches("Producer:").to_string(),
                indices: vec![],
                input_bindings: BTreeMap::new(),
                fan_in: BTreeMap::new(),
                conditions: BTreeMap::new(),
                provider_mapping: Some(ProviderMapping {
                    provider: "acme".to_string(),
                    model: "v1".to_string(),
                }),
                declared_outputs: vec![],
                extras: BTreeMap::new(),
            },
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProviderHandler for CountingHandler {
        async fn invoke(
            &self,
            request: InvokeRequest,
            _cancelled: Arc<tokio::sync::Notify>,
        ) -> Result<InvokeResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(InvokeResponse {
                status: ArtifactStatus::Succeeded,
                artefacts: request
                    .produces
                    .into_iter()
                    .map(|id| ArtefactResult {
                        artefact_id: id,
                        status: ArtifactStatus::Succeeded,
                        blob: Some(BlobInput::Bytes {
                            bytes: b"{\"ok\":true}".to_vec(),
                            mime_type: "application/json".to_string(),
                        }),
                        diagnostics: None,
                    })
                    .collect(),
                diagnostics: None,
            })
        }
    }

    fn registry_with(calls: Arc<AtomicUsize>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(
            ProviderKey::new("acme", "v1", "simulated"),
            Arc::new(CountingHandler { calls }),
        );
        registry
    }

    #[tokio::test]
    async fn single_job_succeeds_and_appends_event() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::clone(&calls));

        let job = plain_job("Producer:Script", vec![aid(IdKind::Artifact, "Script.Out")]);
        let plan = ExecutionPlan {
            revision: Revision::FIRST,
            manifest_base_hash: "h".to_string(),
            layers: vec![vec![job]],
        };

        let summary = execute_plan(
            &plan,
            &BTreeMap::new(),
            &storage,
            &registry,
            &RunnerOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.job_outcomes.len(), 1);
        assert!(matches!(summary.job_outcomes[0].status, JobOutcomeStatus::Succeeded));
        assert_eq!(summary.job_outcomes[0].artefact_events[0].status, ArtifactStatus::Succeeded);
    }

    #[tokio::test]
    async fn upstream_failure_short_circuits_without_invoking_provider() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let event_log = EventLog::new(&storage);

        let upstream_id = aid(IdKind::Artifact, "Script.Out");
        event_log
            .append_artefact(&ArtifactEvent {
                artifact_id: upstream_id.clone(),
                revision: Revision::FIRST,
                inputs_hash: "h".to_string(),
                output: ArtifactOutput::default(),
                status: ArtifactStatus::Failed,
                produced_by: "Producer:Script".to_string(),
                diagnostics: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::clone(&calls));

        let mut job = plain_job("Producer:Audio", vec![aid(IdKind::Artifact, "Audio.Out")]);
        job.context.input_bindings.insert("Text".to_string(), upstream_id);

        let plan = ExecutionPlan {
            revision: Revision::FIRST,
            manifest_base_hash: "h".to_string(),
            layers: vec![vec![job]],
        };

        let summary = execute_plan(
            &plan,
            &BTreeMap::new(),
            &storage,
            &registry,
            &RunnerOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "provider must not be invoked");
        assert!(matches!(summary.job_outcomes[0].status, JobOutcomeStatus::Failed));
        let diagnostics = summary.job_outcomes[0].artefact_events[0].diagnostics.clone().unwrap();
        assert_eq!(diagnostics["reason"], "upstream_failure");
    }

    #[tokio::test]
    async fn unsatisfied_condition_with_no_unconditional_field_skips_job() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::clone(&calls));

        let mut job = plain_job("Producer:Overlay", vec![aid(IdKind::Artifact, "Overlay.Out")]);
        job.context
            .input_bindings
            .insert("Style".to_string(), aid(IdKind::Input, "Overlay.Style"));
        job.context.conditions.insert(
            "Style".to_string(),
            serde_json::json!({"when": "Inputs.Mode", "is": "fancy"}),
        );

        let mut resolved_inputs = BTreeMap::new();
        resolved_inputs.insert("Mode".to_string(), Value::String("plain".to_string()));

        let plan = ExecutionPlan {
            revision: Revision::FIRST,
            manifest_base_hash: "h".to_string(),
            layers: vec![vec![job]],
        };

        let summary = execute_plan(
            &plan,
            &resolved_inputs,
            &storage,
            &registry,
            &RunnerOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(summary.job_outcomes[0].status, JobOutcomeStatus::Skipped));
        let diagnostics = summary.job_outcomes[0].artefact_events[0].diagnostics.clone().unwrap();
        assert_eq!(diagnostics["reason"], "conditions_not_met");
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_every_job_without_invoking_provider() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::clone(&calls));

        let job = plain_job("Producer:Script", vec![aid(IdKind::Artifact, "Script.Out")]);
        let plan = ExecutionPlan {
            revision: Revision::FIRST,
            manifest_base_hash: "h".to_string(),
            layers: vec![vec![job]],
        };

        let token = CancellationToken::new();
        token.cancel();

        let summary = execute_plan(
            &plan,
            &BTreeMap::new(),
            &storage,
            &registry,
            &RunnerOptions::default(),
            &token,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(summary.cancelled);
        assert!(summary.job_outcomes.is_empty(), "layer never started once cancellation seen up front");
    }

    #[tokio::test]
    async fn cancelled_job_records_a_failed_event_not_a_skipped_one() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let event_log = EventLog::new(&storage);
        let blob_store = BlobStore::new(&storage);
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(Arc::clone(&calls));

        let job = plain_job("Producer:Script", vec![aid(IdKind::Artifact, "Script.Out")]);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = run_one_job(
            &job,
            Revision::FIRST,
            &BTreeMap::new(),
            &event_log,
            &blob_store,
            &registry,
            &RunnerOptions::default(),
            &token,
            Arc::new(Semaphore::new(1)),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "provider must not be invoked once cancelled");
        assert!(matches!(outcome.status, JobOutcomeStatus::Failed));
        assert_eq!(outcome.artefact_events.len(), 1);
        let event = &outcome.artefact_events[0];
        assert!(matches!(event.status, ArtifactStatus::Failed));
        assert_eq!(event.diagnostics.as_ref().unwrap()["reason"], "cancelled");
        assert_ne!(event.inputs_hash, "cancelled", "inputs_hash must be a real hash, not the diagnostic literal");
        assert_eq!(event.inputs_hash.len(), 64, "inputs_hash should be a sha256 hex digest");
    }
}
