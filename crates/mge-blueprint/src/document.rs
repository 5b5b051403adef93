//! Typed shape of a single parsed blueprint YAML document (spec §4.F, §6).
//!
//! Sections whose internal shape the core only needs to pass through intact
//! to the expander and condition engine (`connections[].condition`,
//! `collectors`) are kept as [`serde_yaml::Value`] rather than fully typed —
//! they are opaque data to the parser, interpreted downstream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `meta` block: free-form descriptive metadata, consumed but never
/// interpreted structurally by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// One declared blueprint input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDecl {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,
}

/// One declared output artifact of a producer, including its JSON-schema
/// array-decomposition hints (spec §4.G step 4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactDecl {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Leaf paths that decompose into one artifact per array element, e.g.
    /// `["segments"]` for a `{ segments: [...] }` schema.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arrays: Vec<String>,
}

/// A named iteration axis. Cardinality is resolved at expansion time from
/// `count_input`'s value, optionally shifted by `count_input_offset`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopDecl {
    pub name: String,
    pub count_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_input_offset: Option<i64>,
}

/// A producer import: either a relative `path` to a sibling blueprint file,
/// or a catalog-qualified `producer` name resolved under
/// `<catalog>/producers/`. Exactly one of the two must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerImport {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    /// Loop names (declared in an ancestor's `loops`) this producer iterates
    /// over, in nesting order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub within: Vec<String>,
}

/// A `models` entry — only legal in a leaf producer blueprint, never
/// alongside `producers` imports (spec §4.F).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDecl {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// A single directed edge between canonical-ish (possibly dimension-symbolic)
/// endpoints, with an optional condition tree interpreted by `mge-condition`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDecl {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_yaml::Value>,
}

/// Aggregates several per-index sources into one downstream input; the
/// parser normalizes this into canonical fan-in edge notation that
/// `mge-expand` turns into a [`mge_core::FanInDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorDecl {
    pub name: String,
    pub source: String,
    pub group_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    pub target: String,
}

/// Maps an authored input name to a provider/model selection input, or a
/// structural field rename; kept opaque since the shape varies by producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingDecl {
    pub from: String,
    pub to: String,
}

/// The raw, as-authored shape of one blueprint YAML file. Top-level keys
/// not recognised here are preserved in `extra` for forward compatibility
/// but never interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BlueprintDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loops: Vec<LoopDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub producers: Vec<ProducerImport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collectors: Vec<CollectorDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mappings: Vec<MappingDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<ModelDecl>>,
}

impl BlueprintDocument {
    /// Parse a document from raw YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is not valid YAML matching this shape.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}
