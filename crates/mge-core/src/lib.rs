//! Canonical ID grammar, data model, and content hashing shared by every
//! crate in the engine. Nothing here talks to disk, YAML, or a runtime —
//! those concerns live in `mge-storage`, `mge-blueprint`, and `mge-run`.

pub mod hash;
pub mod id;
pub mod model;

pub use hash::{HashError, canonical_json, payload_digest, sha256_hex};
pub use id::{CanonicalId, Dimension, IdKind, IdParseError};
pub use model::{
    ArtefactEntry, ArtifactEvent, ArtifactOutput, ArtifactStatus, BlobRef, ExecutionPlan,
    FanInDescriptor, FanInMember, InputEntry, InputEvent, InputRecord, InputRecordKind,
    JobDescriptor, Manifest, ProducerJobContext, ProviderMapping, Revision, RevisionParseError,
};
