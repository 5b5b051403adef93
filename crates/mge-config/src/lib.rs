//! Engine-level configuration: workspace root, default concurrency, log
//! level, the simulated-providers flag, and a named provider table.
//!
//! Config files are TOML. `EngineConfig::load` reads a base file;
//! `EngineConfig::merge` overlays a second config (e.g. a per-movie
//! override) on top, with the overlay winning field by field.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `concurrency` is unusually large for a single-process scheduler.
    LargeConcurrency {
        /// The configured value.
        value: u32,
    },
    /// A named provider entry has no model list, so planning cannot validate
    /// `NoProducerOptions` against it ahead of time.
    ProviderMissingModels {
        /// The provider name.
        provider: String,
    },
    /// `simulated` is enabled alongside a non-empty provider table; the
    /// table will be ignored.
    SimulatedWithProviders,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LargeConcurrency { value } => {
                write!(f, "concurrency={value} is unusually large for a single-process scheduler")
            }
            Self::ProviderMissingModels { provider } => {
                write!(f, "provider '{provider}' declares no models")
            }
            Self::SimulatedWithProviders => {
                write!(f, "simulated mode is enabled; the configured provider table will be ignored")
            }
        }
    }
}

/// Configuration for one named external provider.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
pub struct ProviderEntry {
    /// Models this provider exposes, by name.
    #[serde(default)]
    pub models: Vec<String>,
    /// Request timeout in seconds; `None` defers to the provider handler's
    /// own default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Top-level runtime configuration for the media-graph engine.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root directory under which `<base_path>/<movie_id>/…` workspaces live.
    pub workspace_root: String,
    /// Storage base path segment, joined under `workspace_root`.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Default job concurrency for the runner when not overridden per-call.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Log level (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When `true`, the provider registry resolves every `(provider, model)`
    /// pair to a stub handler that synthesizes empty-but-typed blobs.
    #[serde(default)]
    pub simulated: bool,
    /// Named provider definitions, keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

fn default_base_path() -> String {
    "movies".to_string()
}

fn default_concurrency() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: ".".to_string(),
            base_path: default_base_path(),
            concurrency: default_concurrency(),
            log_level: default_log_level(),
            simulated: false,
            providers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileNotFound`] if the file does not exist, or
    /// [`ConfigError::ParseError`] if it is not valid TOML for this shape.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Overlay `other` on top of `self`; every field `other` set non-default
    /// wins. Used to apply a per-invocation CLI override on top of a base
    /// config file.
    #[must_use]
    pub fn merge(mut self, other: EngineConfigOverlay) -> Self {
        if let Some(v) = other.workspace_root {
            self.workspace_root = v;
        }
        if let Some(v) = other.base_path {
            self.base_path = v;
        }
        if let Some(v) = other.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = other.log_level {
            self.log_level = v;
        }
        if let Some(v) = other.simulated {
            self.simulated = v;
        }
        for (name, entry) in other.providers {
            self.providers.insert(name, entry);
        }
        self
    }

    /// Run advisory validation, returning both hard errors and soft
    /// warnings. Hard errors make the config unusable; warnings are
    /// informational only.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut reasons = Vec::new();
        if self.workspace_root.trim().is_empty() {
            reasons.push("workspace_root must not be empty".to_string());
        }
        if self.concurrency == 0 {
            reasons.push("concurrency must be at least 1".to_string());
        }
        if !reasons.is_empty() {
            return Err(ConfigError::ValidationError { reasons });
        }

        let mut warnings = Vec::new();
        if self.concurrency > 64 {
            warnings.push(ConfigWarning::LargeConcurrency {
                value: self.concurrency,
            });
        }
        if self.simulated && !self.providers.is_empty() {
            warnings.push(ConfigWarning::SimulatedWithProviders);
        }
        for (name, entry) in &self.providers {
            if entry.models.is_empty() {
                warnings.push(ConfigWarning::ProviderMissingModels {
                    provider: name.clone(),
                });
            }
        }
        Ok(warnings)
    }
}

/// A partial [`EngineConfig`] used as a merge overlay; every field is
/// optional so only explicitly-set values participate in [`EngineConfig::merge`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct EngineConfigOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated: Option<bool>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_with_no_warnings() {
        let cfg = EngineConfig::default();
        let warnings = cfg.validate().unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn empty_workspace_root_fails_validation() {
        let mut cfg = EngineConfig::default();
        cfg.workspace_root = "   ".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let mut cfg = EngineConfig::default();
        cfg.concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn large_concurrency_is_a_warning_not_an_error() {
        let mut cfg = EngineConfig::default();
        cfg.concurrency = 128;
        let warnings = cfg.validate().unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::LargeConcurrency { value: 128 }))
        );
    }

    #[test]
    fn merge_overlay_overrides_only_set_fields() {
        let base = EngineConfig::default();
        let overlay = EngineConfigOverlay {
            concurrency: Some(8),
            ..Default::default()
        };
        let merged = base.merge(overlay);
        assert_eq!(merged.concurrency, 8);
        assert_eq!(merged.base_path, default_base_path());
    }

    #[test]
    fn load_missing_file_returns_file_not_found() {
        let err = EngineConfig::load(Path::new("/nonexistent/mge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mge.toml");
        std::fs::write(&path, "workspace_root = \"/tmp/work\"\nconcurrency = 6\n").unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.workspace_root, "/tmp/work");
        assert_eq!(cfg.concurrency, 6);
        assert_eq!(cfg.base_path, default_base_path());
    }

    #[test]
    fn provider_missing_models_warns() {
        let mut cfg = EngineConfig::default();
        cfg.providers.insert(
            "acme".to_string(),
            ProviderEntry {
                models: Vec::new(),
                timeout_secs: None,
            },
        );
        let warnings = cfg.validate().unwrap();
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::ProviderMissingModels { provider } if provider == "acme"
        )));
    }
}
