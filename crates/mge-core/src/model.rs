//! The data model shared by every stage of the engine: revisions, blobs,
//! events, manifests, execution plans, and job descriptors (spec §3).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::CanonicalId;

/// A monotonically-versioned manifest snapshot identifier, e.g. `rev-0007`.
///
/// Revisions are never reused: [`Revision::next`] always returns a strictly
/// greater value, and a written revision file is never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(u32);

#[derive(Debug, thiserror::Error)]
#[error("invalid revision identifier: {raw:?}")]
pub struct RevisionParseError {
    raw: String,
}

impl Revision {
    /// The first revision a fresh workspace ever produces.
    pub const FIRST: Revision = Revision(1);

    #[must_use]
    pub fn new(n: u32) -> Self {
        Revision(n)
    }

    #[must_use]
    pub fn number(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev-{:04}", self.0)
    }
}

impl FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("rev-").ok_or_else(|| RevisionParseError {
            raw: s.to_string(),
        })?;
        digits
            .parse::<u32>()
            .map(Revision)
            .map_err(|_| RevisionParseError { raw: s.to_string() })
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

impl TryFrom<String> for Revision {
    type Error = RevisionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for Revision {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A content-addressed reference to stored bytes: `{ hash, size, mime_type? }`.
/// Never mutated once written; see [`crate::hash`] for how `hash` is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub hash: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Terminal status of a single produced artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Records a blueprint-input binding for a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    pub input_id: CanonicalId,
    pub revision: Revision,
    /// Canonical-JSON hash of the scalar value.
    pub payload_digest: String,
    /// Present only for file-type inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    pub created_at: DateTime<Utc>,
}

/// The output side of an [`ArtifactEvent`]: a blob when the job actually
/// produced one, `None` for skipped or blob-less artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArtifactOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
}

/// Append-only record of one producer's attempt at one artifact. The latest
/// event for a given `artifact_id` wins when folding into the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub artifact_id: CanonicalId,
    pub revision: Revision,
    /// Content-aware fingerprint of everything the producing job depended
    /// on — not just upstream IDs, their content hashes (spec §4.B/§4.J).
    pub inputs_hash: String,
    pub output: ArtifactOutput,
    pub status: ArtifactStatus,
    pub produced_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// An input's folded state within a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEntry {
    pub payload_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    pub created_at: DateTime<Utc>,
}

impl From<&InputEvent> for InputEntry {
    fn from(event: &InputEvent) -> Self {
        InputEntry {
            payload_digest: event.payload_digest.clone(),
            blob: event.blob.clone(),
            created_at: event.created_at,
        }
    }
}

/// An artifact's folded state within a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactEntry {
    /// Convenience copy of `blob.hash`; absent when the artifact carries no
    /// blob (e.g. `skipped`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    pub produced_by: String,
    pub status: ArtifactStatus,
    pub inputs_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
}

impl From<&ArtifactEvent> for ArtefactEntry {
    fn from(event: &ArtifactEvent) -> Self {
        ArtefactEntry {
            hash: event.output.blob.as_ref().map(|b| b.hash.clone()),
            blob: event.output.blob.clone(),
            produced_by: event.produced_by.clone(),
            status: event.status,
            inputs_hash: event.inputs_hash.clone(),
            created_at: event.created_at,
            diagnostics: event.diagnostics.clone(),
        }
    }
}

/// The folded, immutable state of inputs and artifacts at a given revision.
/// Derivable: folding the event log must reproduce this structure byte for
/// byte (spec §3 invariant 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub revision: Revision,
    pub inputs: BTreeMap<CanonicalId, InputEntry>,
    pub artefacts: BTreeMap<CanonicalId, ArtefactEntry>,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    #[must_use]
    pub fn empty(revision: Revision, created_at: DateTime<Utc>) -> Self {
        Manifest {
            revision,
            inputs: BTreeMap::new(),
            artefacts: BTreeMap::new(),
            created_at,
        }
    }

    #[must_use]
    pub fn artefact_hash(&self, id: &CanonicalId) -> Option<&str> {
        self.artefacts.get(id).and_then(|e| e.hash.as_deref())
    }
}

/// How a single upstream input contributed to a job's `inputs_hash` (spec
/// §4.B).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRecordKind {
    Scalar,
    Artifact,
    Fanin,
}

/// One entry of the `per_input_records` sequence hashed to produce a job's
/// `inputs_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: CanonicalId,
    pub kind: InputRecordKind,
    pub content_hash: String,
}

/// One per-index source collapsed into a fan-in descriptor member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInMember {
    pub id: CanonicalId,
    pub group_index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

/// Represents the set of per-element sources collapsed into a single
/// downstream input (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInDescriptor {
    pub group_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    pub members: Vec<FanInMember>,
}

/// A resolved `(provider, model)` selection for a producer alias, sourced
/// from the inputs file's `providerOptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMapping {
    pub provider: String,
    pub model: String,
}

/// Structural context resolved for a single job at expansion time: namespace
/// path, concrete indices, bindings, fan-in groups, raw condition trees
/// (interpreted later by the condition engine), the SDK mapping, declared
/// outputs, and a bag of values resolved only at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerJobContext {
    pub namespace_path: String,
    pub indices: Vec<i64>,
    pub input_bindings: BTreeMap<String, CanonicalId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fan_in: BTreeMap<String, FanInDescriptor>,
    /// Raw condition trees keyed by the input name they guard; `mge-condition`
    /// owns the tree shape, `mge-core` only carries it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_mapping: Option<ProviderMapping>,
    pub declared_outputs: Vec<CanonicalId>,
    /// Resolved payloads available only at execution time (e.g.
    /// `assetBlobPaths`); empty at plan time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// A unit of scheduled work: one producer invocation at one concrete index
/// tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub producer: String,
    pub inputs: Vec<CanonicalId>,
    pub produces: Vec<CanonicalId>,
    pub context: ProducerJobContext,
}

/// An ordered layering of dirty jobs; executing it, layer by layer, advances
/// the manifest. Ordering between layers is strict; within a layer,
/// unconstrained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub revision: Revision,
    pub manifest_base_hash: String,
    pub layers: Vec<Vec<JobDescriptor>>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|layer| layer.is_empty())
    }

    #[must_use]
    pub fn job_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_formats_with_zero_padding() {
        assert_eq!(Revision::new(7).to_string(), "rev-0007");
        assert_eq!(Revision::FIRST.to_string(), "rev-0001");
    }

    #[test]
    fn revision_round_trips_through_string() {
        let rev: Revision = "rev-0042".parse().unwrap();
        assert_eq!(rev.number(), 42);
        assert_eq!(rev.to_string(), "rev-0042");
    }

    #[test]
    fn revision_rejects_malformed_input() {
        assert!("rev-abc".parse::<Revision>().is_err());
        assert!("0007".parse::<Revision>().is_err());
    }

    #[test]
    fn revision_next_is_strictly_greater() {
        let a = Revision::new(3);
        let b = a.next();
        assert!(b > a);
        assert_eq!(b.number(), 4);
    }

    #[test]
    fn revision_serializes_as_plain_string() {
        let json = serde_json::to_string(&Revision::new(1)).unwrap();
        assert_eq!(json, "\"rev-0001\"");
        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Revision::new(1));
    }

    #[test]
    fn empty_plan_has_no_jobs() {
        let plan = ExecutionPlan {
            revision: Revision::FIRST,
            manifest_base_hash: "deadbeef".into(),
            layers: vec![vec![], vec![]],
        };
        assert!(plan.is_empty());
        assert_eq!(plan.job_count(), 0);
    }

    #[test]
    fn manifest_artefact_hash_looks_up_by_id() {
        let mut manifest = Manifest::empty(Revision::FIRST, Utc::now());
        let id: CanonicalId = "Artifact:Foo.Bar".parse().unwrap();
        manifest.artefacts.insert(
            id.clone(),
            ArtefactEntry {
                hash: Some("abc123".into()),
                blob: None,
                produced_by: "job-1".into(),
                status: ArtifactStatus::Succeeded,
                inputs_hash: "xyz".into(),
                created_at: Utc::now(),
                diagnostics: None,
            },
        );
        assert_eq!(manifest.artefact_hash(&id), Some("abc123"));
        let missing: CanonicalId = "Artifact:Missing".parse().unwrap();
        assert_eq!(manifest.artefact_hash(&missing), None);
    }

    #[test]
    fn input_entry_derives_from_input_event() {
        let event = InputEvent {
            input_id: "Input:Prompt".parse().unwrap(),
            revision: Revision::FIRST,
            payload_digest: "digest".into(),
            blob: None,
            created_at: Utc::now(),
        };
        let entry: InputEntry = (&event).into();
        assert_eq!(entry.payload_digest, "digest");
    }

    #[test]
    fn artefact_entry_copies_blob_hash_as_convenience_field() {
        let event = ArtifactEvent {
            artifact_id: "Artifact:Foo".parse().unwrap(),
            revision: Revision::FIRST,
            inputs_hash: "ih".into(),
            output: ArtifactOutput {
                blob: Some(BlobRef {
                    hash: "h1".into(),
                    size: 10,
                    mime_type: Some("text/plain".into()),
                }),
            },
            status: ArtifactStatus::Succeeded,
            produced_by: "job-1".into(),
            diagnostics: None,
            created_at: Utc::now(),
        };
        let entry: ArtefactEntry = (&event).into();
        assert_eq!(entry.hash.as_deref(), Some("h1"));
    }
}
