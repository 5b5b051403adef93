//! Workspace facade (spec §9): the composition root that wires storage, the
//! event log, the manifest service, the blueprint parser, the expander,
//! the producer graph builder, the planner and the runner into the five
//! library entry points spec §6 names for the CLI: `plan`, `execute`,
//! `list`, `explain`, `clean`.
#![deny(unsafe_code)]

pub mod inputs;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use mge_blueprint::{BlueprintError, BlueprintNode, BlueprintParser};
use mge_blob::{BlobError, BlobStore};
use mge_core::{CanonicalId, ExecutionPlan, Manifest, Revision};
use mge_eventlog::{EventLog, EventLogError};
use mge_expand::ExpandError;
use mge_graph::ProducerGraph;
use mge_manifest::{ManifestBuildError, ManifestService};
use mge_plan::{PlanError, PlanExplanation, PlanOptions};
use mge_planstore::{PlanStore, PlanStoreError};
use mge_provider::ProviderRegistry;
use mge_recovery::{RecoveryError, RecoveryPrepassSummary};
use mge_run::cancel::CancellationToken;
use mge_run::{RunnerError, RunnerOptions, RunSummary};
use mge_storage::{MovieStorage, StorageBackend, StorageError};
use serde_json::Value;

use inputs::ResolvedInputs;

/// Everything that can go wrong driving a workspace operation end to end.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Blueprint(#[from] BlueprintError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Manifest(#[from] ManifestBuildError),
    #[error(transparent)]
    PlanStore(#[from] PlanStoreError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Hash(#[from] mge_core::HashError),
    /// `reRunFrom` (or, equivalently, any operation needing a prior
    /// manifest) was requested on a workspace that has never produced one
    /// (spec §7, `STAGE_START_REQUIRES_PREDECESSOR`).
    #[error("no prior manifest exists for this movie; cannot re-run from a layer")]
    NoPriorManifest,
    /// A surgical target named an artifact ID the prior manifest never
    /// produced (spec §8, boundary behavior).
    #[error("surgical target '{0}' does not exist in the manifest")]
    UnknownSurgicalTarget(CanonicalId),
}

/// Caller-supplied knobs for [`Workspace::plan`].
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub re_run_from_layer: Option<usize>,
    pub target_artifact_ids: std::collections::BTreeSet<CanonicalId>,
    pub collect_explanation: bool,
}

/// Result of [`Workspace::plan`]: the plan itself, the prior manifest it was
/// diffed against (`None` for a fresh workspace), and an optional
/// explanation. Cost estimation is an external collaborator (spec §1) and
/// is deliberately absent here.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: ExecutionPlan,
    pub prior_manifest: Option<Manifest>,
    pub explanation: Option<PlanExplanation>,
}

/// Result of [`Workspace::execute`]: the runner's summary plus the manifest
/// rebuilt from the event log afterwards. `manifest` is the prior manifest
/// unchanged when the run was cancelled before any layer completed and
/// `current.json` was therefore never advanced.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub run: RunSummary,
    pub manifest: Manifest,
    pub advanced: bool,
}

/// One row of [`Workspace::list`]: a revision's manifest, summarized.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub revision: Revision,
    pub created_at: chrono::DateTime<Utc>,
    pub input_count: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
}

/// Result of [`Workspace::explain`]: why the next plan would do what it
/// does, plus whatever the recovery pre-pass found before planning ran.
#[derive(Debug, Clone)]
pub struct ExplainOutcome {
    pub explanation: PlanExplanation,
    pub recovery: RecoveryPrepassSummary,
}

/// Options for [`Workspace::clean`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    /// Report what would be removed without touching storage.
    pub dry_run: bool,
}

/// Owns one movie's storage, event log, and manifest service, and exposes
/// the library entry points the CLI (or any other caller) drives a build
/// through (spec §9: "expose a `Workspace` handle ... pass it explicitly").
pub struct Workspace<B: StorageBackend> {
    storage: MovieStorage<B>,
    catalog_root: Option<std::path::PathBuf>,
}

impl<B: StorageBackend> Workspace<B> {
    /// Scope a workspace to one movie's storage, with an optional catalog
    /// root for blueprint producer imports.
    #[must_use]
    pub fn new(storage: MovieStorage<B>, catalog_root: Option<std::path::PathBuf>) -> Self {
        Self { storage, catalog_root }
    }

    /// Parse and expand `blueprint_path` with `resolved`'s values, build the
    /// producer graph, run the recovery pre-pass, and diff against the prior
    /// manifest to produce an [`ExecutionPlan`] (spec §4.J).
    ///
    /// # Errors
    ///
    /// See [`WorkspaceError`]; `NoPriorManifest` if `request.re_run_from_layer`
    /// is set but no prior manifest exists (spec §7
    /// `STAGE_START_REQUIRES_PREDECESSOR`), `UnknownSurgicalTarget` if a
    /// `target_artifact_ids` entry never appears in the prior manifest.
    pub async fn plan(
        &self,
        blueprint_path: &Path,
        resolved: &ResolvedInputs,
        request: &PlanRequest,
    ) -> Result<PlanOutcome, WorkspaceError> {
        let parser = BlueprintParser::new(self.catalog_root.clone());
        let root = parser.parse(blueprint_path)?;

        let graph = self.build_graph(&root, &resolved.values, &resolved.provider_options)?;

        let manifest_service = ManifestService::new(&self.storage);
        let prior_manifest = manifest_service.load_current().await?;

        if request.re_run_from_layer.is_some() && prior_manifest.is_none() {
            return Err(WorkspaceError::NoPriorManifest);
        }
        if let Some(prior) = &prior_manifest {
            for target in &request.target_artifact_ids {
                if !prior.artefacts.contains_key(target) {
                    return Err(WorkspaceError::UnknownSurgicalTarget(target.clone()));
                }
            }
        }

        let target_revision = prior_manifest
            .as_ref()
            .map_or(Revision::FIRST, |m| m.revision.next());
        let manifest_base_hash = match &prior_manifest {
            Some(m) => mge_core::payload_digest(m)?,
            None => mge_core::payload_digest(&Value::Null)?,
        };

        let plan_store = PlanStore::new(&self.storage);
        let prior_plan = match &prior_manifest {
            Some(m) if plan_store.exists(m.revision).await? => Some(plan_store.load(m.revision).await?),
            _ => None,
        };

        let options = PlanOptions {
            re_run_from_layer: request.re_run_from_layer,
            target_artifact_ids: request.target_artifact_ids.clone(),
            artifact_overrides: resolved.artifact_overrides.clone(),
            collect_explanation: request.collect_explanation,
        };

        let result = mge_plan::plan(
            &graph,
            prior_manifest.as_ref(),
            prior_plan.as_ref(),
            &resolved.values,
            target_revision,
            manifest_base_hash,
            &options,
        )?;

        Ok(PlanOutcome {
            plan: result.plan,
            prior_manifest,
            explanation: result.explanation,
        })
    }

    /// Persist a planned run (spec §4.J step 8): initialize on-disk movie
    /// storage if this is the first revision, append the resolved inputs as
    /// [`mge_core::InputEvent`]s, and save the plan under
    /// `runs/<revision>-plan.json`. Call this only after the caller has
    /// confirmed the plan; a cancelled plan should simply be discarded.
    pub async fn persist_plan(
        &self,
        outcome: &PlanOutcome,
        resolved: &ResolvedInputs,
    ) -> Result<(), WorkspaceError> {
        let event_log = EventLog::new(&self.storage);
        let already_logged: std::collections::BTreeSet<CanonicalId> = event_log
            .read_input_events()
            .await?
            .into_iter()
            .map(|e| e.input_id)
            .collect();
        let input_events = mge_plan::compute_input_events(
            &resolved.values,
            &already_logged,
            outcome.plan.revision,
            Utc::now(),
        )?;
        for event in &input_events {
            event_log.append_input(event).await?;
        }

        let plan_store = PlanStore::new(&self.storage);
        plan_store.save(&outcome.plan).await?;
        Ok(())
    }

    /// Run every layer of `plan`, then rebuild the manifest from the event
    /// log and advance `current.json` — unless the run was cancelled before
    /// any job ran, in which case the pointer is left untouched (spec §5).
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        resolved_values: &BTreeMap<String, Value>,
        registry: &ProviderRegistry,
        runner_options: &RunnerOptions,
        token: &CancellationToken,
    ) -> Result<ExecuteOutcome, WorkspaceError> {
        let run = mge_run::execute_plan(plan, resolved_values, &self.storage, registry, runner_options, token)
            .await?;

        let manifest_service = ManifestService::new(&self.storage);
        if run.cancelled && run.job_outcomes.is_empty() {
            let manifest = manifest_service
                .load_current()
                .await?
                .unwrap_or_else(|| Manifest::empty(plan.revision, Utc::now()));
            return Ok(ExecuteOutcome {
                run,
                manifest,
                advanced: false,
            });
        }

        let manifest = manifest_service
            .build_from_events(plan.revision, Utc::now())
            .await?;
        Ok(ExecuteOutcome {
            run,
            manifest,
            advanced: true,
        })
    }

    /// Reconcile the prior manifest's succeeded artifacts with on-disk blob
    /// reality before planning (spec §4.M).
    pub async fn recovery_prepass(&self) -> Result<RecoveryPrepassSummary, WorkspaceError> {
        let manifest_service = ManifestService::new(&self.storage);
        let Some(manifest) = manifest_service.load_current().await? else {
            return Ok(RecoveryPrepassSummary::default());
        };
        let event_log = EventLog::new(&self.storage);
        let blob_store = BlobStore::new(&self.storage);
        Ok(mge_recovery::run_prepass(&manifest, &event_log, &blob_store).await?)
    }

    /// Build every [`BuildInfo`] for revisions this movie has a manifest
    /// for, oldest first.
    pub async fn list(&self) -> Result<Vec<BuildInfo>, WorkspaceError> {
        let entries = self
            .storage
            .list("revisions", mge_storage::ListOptions { deep: false })
            .await?;
        let manifest_service = ManifestService::new(&self.storage);

        let mut revisions: Vec<Revision> = entries
            .iter()
            .filter_map(|path| path.rsplit('/').next())
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(|stem| stem.parse::<Revision>().ok())
            .collect();
        revisions.sort();

        let mut infos = Vec::with_capacity(revisions.len());
        for revision in revisions {
            let manifest = manifest_service.load_revision(revision).await?;
            infos.push(summarize(&manifest));
        }
        Ok(infos)
    }

    /// Run the recovery pre-pass, then plan with `collect_explanation`
    /// forced on, returning both for display to the user (spec §4.M, §6).
    pub async fn explain(
        &self,
        blueprint_path: &Path,
        resolved: &ResolvedInputs,
        request: &PlanRequest,
    ) -> Result<ExplainOutcome, WorkspaceError> {
        let recovery = self.recovery_prepass().await?;
        let mut request = request.clone();
        request.collect_explanation = true;
        let outcome = self.plan(blueprint_path, resolved, &request).await?;
        Ok(ExplainOutcome {
            explanation: outcome
                .explanation
                .expect("collect_explanation was forced true"),
            recovery,
        })
    }

    /// Delete this movie's entire on-disk state: `current.json`, every
    /// revision manifest, every saved plan, both event logs, and every blob
    /// (spec §6's file layout; deletion is the only way blobs are ever
    /// removed, per spec §3 invariant 5). With `dry_run` set, nothing is
    /// touched.
    pub async fn clean(&self, options: CleanOptions) -> Result<(), WorkspaceError> {
        if options.dry_run {
            return Ok(());
        }
        self.storage.remove_dir("").await?;
        Ok(())
    }
}

impl<B: StorageBackend> Workspace<B> {
    fn build_graph(
        &self,
        root: &BlueprintNode,
        resolved_values: &BTreeMap<String, Value>,
        provider_options: &BTreeMap<String, mge_core::ProviderMapping>,
    ) -> Result<ProducerGraph, WorkspaceError> {
        let expanded = mge_expand::expand(root, resolved_values)?;
        let mut graph = mge_graph::build(&expanded);
        apply_provider_mappings(&mut graph, provider_options);
        Ok(graph)
    }
}

fn summarize(manifest: &Manifest) -> BuildInfo {
    let mut succeeded = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for entry in manifest.artefacts.values() {
        match entry.status {
            mge_core::ArtifactStatus::Succeeded => succeeded += 1,
            mge_core::ArtifactStatus::Failed => failed += 1,
            mge_core::ArtifactStatus::Skipped => skipped += 1,
        }
    }
    BuildInfo {
        revision: manifest.revision,
        created_at: manifest.created_at,
        input_count: manifest.inputs.len(),
        succeeded_count: succeeded,
        failed_count: failed,
        skipped_count: skipped,
    }
}

/// Apply `providerOptions` from a loaded inputs file onto every job in
/// `graph` whose producer alias (its root namespace segment) matches, so
/// the runner has a `(provider, model)` to resolve before invoking a
/// handler. Producers with no matching entry are left with no mapping and
/// fail at execution time with `no_provider_mapping` (spec §4.O).
pub fn apply_provider_mappings(
    graph: &mut ProducerGraph,
    provider_options: &BTreeMap<String, mge_core::ProviderMapping>,
) {
    for node in graph.nodes.values_mut() {
        let alias = node
            .job
            .producer
            .split('.')
            .next()
            .unwrap_or(&node.job.producer);
        if let Some(mapping) = provider_options.get(alias) {
            node.job.context.provider_mapping = Some(mapping.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mge_storage::MemoryBackend;
    use std::io::Write;

    fn write_blueprint(dir: &std::path::Path) -> std::path::PathBuf {
        let script = dir.join("script.yaml");
        std::fs::write(
            &script,
            "meta:\n  name: script\ninputs:\n  - name: Prompt\n    required: true\n",
        )
        .unwrap();
        let audio = dir.join("audio.yaml");
        std::fs::write(
            &audio,
            "meta:\n  name: audio\ninputs:\n  - name: Text\n    required: true\n",
        )
        .unwrap();
        let root = dir.join("root.yaml");
        let mut f = std::fs::File::create(&root).unwrap();
        writeln!(
            f,
            "producers:\n  - alias: Script\n    path: ./script.yaml\n  - alias: Audio\n    path: ./audio.yaml\nconnections:\n  - from: Inputs.Prompt\n    to: Script.Prompt\n  - from: Script.NarrationScript\n    to: Audio.Text\n"
        )
        .unwrap();
        root
    }

    #[tokio::test]
    async fn plan_on_fresh_workspace_schedules_every_producer_in_two_layers() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_blueprint(dir.path());

        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let workspace = Workspace::new(storage, None);

        let resolved = ResolvedInputs {
            values: BTreeMap::from([("Prompt".to_string(), Value::String("Hello".to_string()))]),
            ..Default::default()
        };

        let outcome = workspace
            .plan(&root, &resolved, &PlanRequest::default())
            .await
            .unwrap();

        assert!(outcome.prior_manifest.is_none());
        assert_eq!(outcome.plan.revision, Revision::FIRST);
        assert_eq!(outcome.plan.job_count(), 2);
    }

    #[tokio::test]
    async fn re_run_from_with_no_prior_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_blueprint(dir.path());
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let workspace = Workspace::new(storage, None);

        let resolved = ResolvedInputs {
            values: BTreeMap::from([("Prompt".to_string(), Value::String("Hello".to_string()))]),
            ..Default::default()
        };
        let request = PlanRequest {
            re_run_from_layer: Some(0),
            ..Default::default()
        };

        let err = workspace.plan(&root, &resolved, &request).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::NoPriorManifest));
    }

    #[tokio::test]
    async fn clean_removes_every_file_under_the_movie_scope() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        storage
            .write("current.json", b"{}".to_vec(), mge_storage::WriteOptions::default())
            .await
            .unwrap();
        let workspace = Workspace::new(storage, None);

        workspace.clean(CleanOptions::default()).await.unwrap();
        assert!(!workspace.storage.exists("current.json").await.unwrap());
    }

    #[tokio::test]
    async fn clean_dry_run_leaves_storage_untouched() {
        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        storage
            .write("current.json", b"{}".to_vec(), mge_storage::WriteOptions::default())
            .await
            .unwrap();
        let workspace = Workspace::new(storage, None);

        workspace.clean(CleanOptions { dry_run: true }).await.unwrap();
        assert!(workspace.storage.exists("current.json").await.unwrap());
    }

    #[tokio::test]
    async fn plan_applies_provider_mappings_from_resolved_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = write_blueprint(dir.path());

        let backend = MemoryBackend::new();
        let storage = MovieStorage::new(backend, "movies", "m1");
        let workspace = Workspace::new(storage, None);

        let resolved = ResolvedInputs {
            values: BTreeMap::from([("Prompt".to_string(), Value::String("Hello".to_string()))]),
            provider_options: BTreeMap::from([(
                "Script".to_string(),
                mge_core::ProviderMapping {
                    provider: "acme".to_string(),
                    model: "v1".to_string(),
                },
            )]),
            ..Default::default()
        };

        let outcome = workspace
            .plan(&root, &resolved, &PlanRequest::default())
            .await
            .unwrap();

        let script_job = outcome
            .plan
            .layers
            .iter()
            .flatten()
            .find(|job| job.producer == "Script")
            .expect("script producer scheduled");
        assert_eq!(
            script_job.context.provider_mapping,
            Some(mge_core::ProviderMapping {
                provider: "acme".to_string(),
                model: "v1".to_string(),
            })
        );

        let audio_job = outcome
            .plan
            .layers
            .iter()
            .flatten()
            .find(|job| job.producer == "Audio")
            .expect("audio producer scheduled");
        assert_eq!(audio_job.context.provider_mapping, None);
    }

    #[test]
    fn apply_provider_mappings_matches_by_root_alias() {
        let mut graph = ProducerGraph::default();
        let job = mge_core::JobDescriptor {
            job_id: "Producer:Script".to_string(),
            producer: "Script".to_string(),
            inputs: vec![],
            produces: vec![],
            context: mge_core::ProducerJobContext::default(),
        };
        graph.nodes.insert(
            "Producer:Script".to_string(),
            mge_graph::GraphNode {
                job,
                depends_on: Default::default(),
            },
        );
        let options = BTreeMap::from([(
            "Script".to_string(),
            mge_core::ProviderMapping {
                provider: "acme".to_string(),
                model: "v1".to_string(),
            },
        )]);
        apply_provider_mappings(&mut graph, &options);
        assert_eq!(
            graph.nodes["Producer:Script"].job.context.provider_mapping,
            Some(mge_core::ProviderMapping {
                provider: "acme".to_string(),
                model: "v1".to_string(),
            })
        );
    }
}
