//! Planner (spec §4.J): diffs producer jobs against the prior manifest,
//! marks dirty jobs, propagates dirtiness forward, and layers the dirty
//! subgraph with Kahn's algorithm.
#![deny(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use mge_condition::ConditionNode;
use mge_core::{
    payload_digest, ArtifactStatus, CanonicalId, ExecutionPlan, IdKind, InputEvent, JobDescriptor,
    Manifest, Revision,
};
use mge_graph::ProducerGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while planning a run.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// An unconditional consumer's only path to an artifact passes through
    /// a producer that is itself only reachable via an input-gated
    /// condition this planner can prove, from free-standing input values
    /// alone, will never be satisfied (spec §9 open question resolution).
    #[error("blueprint validation failed: job '{consumer}' unconditionally requires '{artifact}', which is only produced behind an unsatisfiable condition on job '{producer}'")]
    UnreachableUnconditionalDependency {
        consumer: String,
        artifact: String,
        producer: String,
    },
    /// A condition tree attached to a job's context failed to parse.
    #[error(transparent)]
    Condition(#[from] mge_condition::ConditionError),
    /// Canonical hashing of an input or job record failed.
    #[error(transparent)]
    Hash(#[from] mge_core::HashError),
}

/// Options controlling a single `plan()` invocation (spec §4.J).
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Force every job at or above this layer index (from the prior plan)
    /// dirty, regardless of hash comparison.
    pub re_run_from_layer: Option<usize>,
    /// Surgical mode: force dirty any job whose `produces` intersects this
    /// set.
    pub target_artifact_ids: BTreeSet<CanonicalId>,
    /// Pre-persisted artifact overrides supplied by the caller; forces the
    /// owning job dirty.
    pub artifact_overrides: BTreeSet<CanonicalId>,
    /// Whether to additionally build a [`PlanExplanation`].
    pub collect_explanation: bool,
}

/// Why a job was marked dirty (spec §4.J step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirtyReason {
    InputsChanged,
    UpstreamDirty,
    LatestAttemptFailed,
    ReRunFromLayer,
    SurgicalTarget,
    ArtifactOverride,
}

/// One job's dirtiness explanation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReason {
    pub job_id: String,
    pub reason: DirtyReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_jobs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_artifacts: Option<Vec<String>>,
}

/// Full accounting of why the plan contains the jobs it does.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanExplanation {
    pub dirty_inputs: Vec<CanonicalId>,
    pub dirty_artefacts: Vec<CanonicalId>,
    pub job_reasons: Vec<JobReason>,
    pub initial_dirty_jobs: Vec<String>,
    pub propagated_jobs: Vec<String>,
}

/// Result of planning: the execution plan plus an optional explanation.
#[derive(Debug, Clone)]
pub struct PlanResult {
    pub plan: ExecutionPlan,
    pub explanation: Option<PlanExplanation>,
}

/// Build the [`InputEvent`] set for a revision from resolved free-standing
/// input values, deduping against events already recorded for this movie
/// (spec §4.J step 3).
///
/// # Errors
///
/// Propagates [`mge_core::HashError`] if a value cannot be canonically
/// hashed.
pub fn compute_input_events(
    resolved_inputs: &BTreeMap<String, Value>,
    already_logged: &BTreeSet<CanonicalId>,
    revision: Revision,
    created_at: DateTime<Utc>,
) -> Result<Vec<InputEvent>, mge_core::HashError> {
    let mut events = Vec::new();
    for (name, value) in resolved_inputs {
        let id = CanonicalId::new(IdKind::Input, name.clone(), vec![]);
        if already_logged.contains(&id) {
            continue;
        }
        events.push(InputEvent {
            input_id: id,
            revision,
            payload_digest: payload_digest(value)?,
            blob: None,
            created_at,
        });
    }
    Ok(events)
}

fn job_dirty_reason(
    job: &JobDescriptor,
    prior: Option<&Manifest>,
    resolved_inputs: &BTreeMap<String, Value>,
    options: &PlanOptions,
    layer_of: &BTreeMap<String, usize>,
) -> Option<DirtyReason> {
    if options
        .target_artifact_ids
        .iter()
        .any(|id| job.produces.contains(id))
    {
        return Some(DirtyReason::SurgicalTarget);
    }
    if options
        .artifact_overrides
        .iter()
        .any(|id| job.produces.contains(id))
    {
        return Some(DirtyReason::ArtifactOverride);
    }
    if let Some(re_run_layer) = options.re_run_from_layer {
        if layer_of.get(&job.job_id).is_some_and(|&l| l >= re_run_layer) {
            return Some(DirtyReason::ReRunFromLayer);
        }
    }

    let Some(manifest) = prior else {
        return Some(DirtyReason::InputsChanged);
    };

    for (field, input_id) in &job.context.input_bindings {
        if input_id.kind() != IdKind::Input {
            continue;
        }
        // Free-standing inputs are named directly; producer-scoped input
        // bindings reference resolved values by their bare field name.
        let name = if input_id.qname().contains('.') {
            field.clone()
        } else {
            input_id.qname().to_string()
        };
        let Some(value) = resolved_inputs.get(&name) else {
            continue;
        };
        let Some(prior_entry) = manifest.inputs.get(input_id) else {
            return Some(DirtyReason::InputsChanged);
        };
        let Ok(current_digest) = payload_digest(value) else {
            return Some(DirtyReason::InputsChanged);
        };
        if current_digest != prior_entry.payload_digest {
            return Some(DirtyReason::InputsChanged);
        }
    }

    for produced in &job.produces {
        match manifest.artefacts.get(produced) {
            None => return Some(DirtyReason::InputsChanged),
            Some(entry) if entry.status == ArtifactStatus::Failed => {
                return Some(DirtyReason::LatestAttemptFailed)
            }
            Some(_) => {}
        }
    }

    None
}

/// Determine, from free-standing resolved inputs alone, whether a job's
/// conditions can be proven unsatisfiable at plan time. Conditions
/// referencing artifact data (not yet resolved) are treated as
/// "unknown" — never flagged, since only the Runner can evaluate them.
fn is_definitively_unreachable(job: &JobDescriptor, resolved_inputs: &BTreeMap<String, Value>) -> bool {
    if job.context.conditions.is_empty() {
        return false;
    }
    let as_values: BTreeMap<String, Value> = resolved_inputs
        .iter()
        .map(|(k, v)| (format!("Inputs.{k}"), v.clone()))
        .collect();

    job.context.conditions.values().all(|raw| {
        let Ok(node) = ConditionNode::parse(raw) else {
            return false;
        };
        let only_scalar_paths = node
            .referenced_paths()
            .iter()
            .all(|p| p.starts_with("Inputs."));
        if !only_scalar_paths {
            return false;
        }
        !node.evaluate(&as_values).unwrap_or(true)
    })
}

/// Validate that no unconditional consumer's sole path to an artifact
/// passes through a producer this planner can prove unreachable (spec §9).
///
/// # Errors
///
/// Returns [`PlanError::UnreachableUnconditionalDependency`] on the first
/// such ambiguity found.
pub fn validate_conditional_reachability(
    graph: &ProducerGraph,
    resolved_inputs: &BTreeMap<String, Value>,
) -> Result<(), PlanError> {
    let unreachable: BTreeSet<&String> = graph
        .nodes
        .values()
        .filter(|n| is_definitively_unreachable(&n.job, resolved_inputs))
        .map(|n| &n.job.job_id)
        .collect();

    if unreachable.is_empty() {
        return Ok(());
    }

    for node in graph.nodes.values() {
        if !node.job.context.conditions.is_empty() {
            continue;
        }
        for dep in &node.depends_on {
            if unreachable.contains(dep) {
                let Some(dep_node) = graph.nodes.get(dep) else {
                    continue;
                };
                let artifact = dep_node
                    .job
                    .produces
                    .first()
                    .map_or_else(|| dep.clone(), ToString::to_string);
                return Err(PlanError::UnreachableUnconditionalDependency {
                    consumer: node.job.job_id.clone(),
                    artifact,
                    producer: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Produce an [`ExecutionPlan`] for `graph` against `prior` (if any),
/// applying `options` and (optionally) an explanation.
///
/// # Errors
///
/// Returns [`PlanError`] if conditional-reachability validation fails or a
/// value cannot be canonically hashed.
pub fn plan(
    graph: &ProducerGraph,
    prior: Option<&Manifest>,
    prior_plan: Option<&ExecutionPlan>,
    resolved_inputs: &BTreeMap<String, Value>,
    revision: Revision,
    manifest_base_hash: String,
    options: &PlanOptions,
) -> Result<PlanResult, PlanError> {
    validate_conditional_reachability(graph, resolved_inputs)?;

    let layer_of = prior_layer_index(prior_plan);

    let mut dirty: BTreeMap<String, DirtyReason> = BTreeMap::new();
    for node in graph.nodes.values() {
        if let Some(reason) = job_dirty_reason(&node.job, prior, resolved_inputs, options, &layer_of) {
            dirty.insert(node.job.job_id.clone(), reason);
        }
    }
    let initial_dirty: Vec<String> = dirty.keys().cloned().collect();

    // Forward propagation: any job depending (directly or transitively) on
    // a dirty job becomes dirty too.
    let mut dependents: BTreeMap<&String, Vec<&String>> = BTreeMap::new();
    for node in graph.nodes.values() {
        for dep in &node.depends_on {
            dependents.entry(dep).or_default().push(&node.job.job_id);
        }
    }
    let mut queue: VecDeque<String> = dirty.keys().cloned().collect();
    let mut propagated = Vec::new();
    while let Some(job_id) = queue.pop_front() {
        let Some(children) = dependents.get(&job_id) else {
            continue;
        };
        for child in children.clone() {
            if !dirty.contains_key(child) {
                dirty.insert(child.clone(), DirtyReason::UpstreamDirty);
                propagated.push(child.clone());
                queue.push_back(child.clone());
            }
        }
    }

    let layers = layer_dirty_subgraph(graph, &dirty);

    let plan = ExecutionPlan {
        revision,
        manifest_base_hash,
        layers,
    };

    let explanation = options.collect_explanation.then(|| {
        let mut job_reasons: Vec<JobReason> = dirty
            .iter()
            .map(|(job_id, reason)| {
                let upstream_jobs = (*reason == DirtyReason::UpstreamDirty).then(|| {
                    graph
                        .nodes
                        .get(job_id)
                        .map(|n| n.depends_on.iter().cloned().collect())
                        .unwrap_or_default()
                });
                JobReason {
                    job_id: job_id.clone(),
                    reason: *reason,
                    upstream_jobs,
                    failed_artifacts: None,
                }
            })
            .collect();
        job_reasons.sort_by(|a, b| a.job_id.cmp(&b.job_id));

        PlanExplanation {
            dirty_inputs: Vec::new(),
            dirty_artefacts: Vec::new(),
            job_reasons,
            initial_dirty_jobs: initial_dirty.clone(),
            propagated_jobs: propagated.clone(),
        }
    });

    Ok(PlanResult { plan, explanation })
}

/// Map every job in `prior_plan` to its layer index, so `re_run_from_layer`
/// can force dirty any job at or above a given layer of the *previous* run
/// (spec §4.J step 4, `reRunFromLayer`). Absent a prior plan, the map is
/// empty and only `re_run_from_layer = Some(0)` has any effect (every job
/// is then unconditionally below no layer, so nothing is force-dirtied by
/// this check alone — callers without a prior plan rely on the `prior`
/// manifest being `None` too, which already marks everything dirty).
fn prior_layer_index(prior_plan: Option<&ExecutionPlan>) -> BTreeMap<String, usize> {
    let Some(plan) = prior_plan else {
        return BTreeMap::new();
    };
    let mut index = BTreeMap::new();
    for (layer_idx, layer) in plan.layers.iter().enumerate() {
        for job in layer {
            index.insert(job.job_id.clone(), layer_idx);
        }
    }
    index
}

/// Layer the dirty subgraph with Kahn's algorithm: producers with no dirty
/// predecessor land in layer 0; ties break by producer name, then index
/// tuple, lexicographically (spec §4.J step 6).
fn layer_dirty_subgraph(
    graph: &ProducerGraph,
    dirty: &BTreeMap<String, DirtyReason>,
) -> Vec<Vec<JobDescriptor>> {
    let mut remaining_deps: BTreeMap<&String, BTreeSet<&String>> = BTreeMap::new();
    for job_id in dirty.keys() {
        let Some(node) = graph.nodes.get(job_id) else {
            continue;
        };
        let deps: BTreeSet<&String> = node
            .depends_on
            .iter()
            .filter(|d| dirty.contains_key(*d))
            .collect();
        remaining_deps.insert(job_id, deps);
    }

    let mut layers = Vec::new();
    let mut placed: BTreeSet<String> = BTreeSet::new();

    while placed.len() < remaining_deps.len() {
        let mut ready: Vec<&String> = remaining_deps
            .iter()
            .filter(|(job_id, deps)| {
                !placed.contains(job_id.as_str()) && deps.iter().all(|d| placed.contains(d.as_str()))
            })
            .map(|(job_id, _)| *job_id)
            .collect();

        if ready.is_empty() {
            break;
        }

        ready.sort_by_key(|job_id| {
            let node = &graph.nodes[*job_id];
            (node.job.producer.clone(), node.job.context.indices.clone())
        });

        let layer: Vec<JobDescriptor> = ready
            .iter()
            .map(|job_id| graph.nodes[*job_id].job.clone())
            .collect();

        for job_id in &ready {
            placed.insert((*job_id).clone());
        }
        layers.push(layer);
    }

    layers
}
