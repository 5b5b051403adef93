//! Inputs YAML loader (spec §6): a movie's inputs file contributes scalar
//! values, `(provider, model)` selections keyed by producer alias, and a
//! set of artifact IDs to treat as externally pre-persisted overrides.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use mge_core::{CanonicalId, ProviderMapping};
use serde::Deserialize;
use serde_json::Value;

/// Errors raised while loading an inputs file.
#[derive(Debug, thiserror::Error)]
pub enum InputsError {
    #[error("inputs file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("artifact override '{raw}' is not a valid canonical ID: {source}")]
    InvalidOverride {
        raw: String,
        #[source]
        source: mge_core::IdParseError,
    },
}

/// Raw, as-authored shape of an inputs YAML document.
#[derive(Debug, Default, Deserialize)]
struct RawInputsDocument {
    #[serde(default)]
    inputs: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, rename = "providerOptions")]
    provider_options: BTreeMap<String, RawProviderOption>,
    #[serde(default, rename = "artifactOverrides")]
    artifact_overrides: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawProviderOption {
    provider: String,
    model: String,
}

/// The resolved result of loading an inputs file: free-standing scalar
/// values, a provider/model mapping per producer alias, and a set of
/// artifact IDs the caller wants treated as pre-persisted overrides.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    pub values: BTreeMap<String, Value>,
    pub provider_options: BTreeMap<String, ProviderMapping>,
    pub artifact_overrides: BTreeSet<CanonicalId>,
}

/// Parse `raw` (the contents of a movie's inputs YAML file) into a
/// [`ResolvedInputs`].
///
/// # Errors
///
/// Returns [`InputsError::Yaml`] if `raw` is not valid YAML for this shape,
/// or [`InputsError::InvalidOverride`] if an `artifactOverrides` entry is
/// not a well-formed canonical ID.
pub fn load_inputs(raw: &str) -> Result<ResolvedInputs, InputsError> {
    let doc: RawInputsDocument = serde_yaml::from_str(raw)?;

    let values = doc
        .inputs
        .into_iter()
        .map(|(name, value)| (name, yaml_to_json(value)))
        .collect();

    let provider_options = doc
        .provider_options
        .into_iter()
        .map(|(alias, opt)| {
            (
                alias,
                ProviderMapping {
                    provider: opt.provider,
                    model: opt.model,
                },
            )
        })
        .collect();

    let artifact_overrides = doc
        .artifact_overrides
        .into_iter()
        .map(|raw| {
            raw.parse::<CanonicalId>()
                .map_err(|source| InputsError::InvalidOverride { raw, source })
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(ResolvedInputs {
        values,
        provider_options,
        artifact_overrides,
    })
}

fn yaml_to_json(value: serde_yaml::Value) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_and_provider_options() {
        let raw = r#"
inputs:
  Prompt: "Hello"
  SegmentCount: 3
providerOptions:
  Script:
    provider: acme
    model: v1
artifactOverrides:
  - "Artifact:Audio.GeneratedAudio[0]"
"#;
        let resolved = load_inputs(raw).unwrap();
        assert_eq!(resolved.values["Prompt"], Value::String("Hello".to_string()));
        assert_eq!(resolved.values["SegmentCount"], Value::from(3));
        assert_eq!(resolved.provider_options["Script"].provider, "acme");
        assert_eq!(resolved.artifact_overrides.len(), 1);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let resolved = load_inputs("inputs:\n  Prompt: Hi\n").unwrap();
        assert!(resolved.provider_options.is_empty());
        assert!(resolved.artifact_overrides.is_empty());
    }

    #[test]
    fn malformed_artifact_override_is_rejected() {
        let raw = "artifactOverrides:\n  - \"not a canonical id\"\n";
        let err = load_inputs(raw).unwrap_err();
        assert!(matches!(err, InputsError::InvalidOverride { .. }));
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = load_inputs("not: [valid: yaml: at: all").unwrap_err();
        assert!(matches!(err, InputsError::Yaml(_)));
    }
}
