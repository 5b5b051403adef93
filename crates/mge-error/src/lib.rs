//! Stable error taxonomy for the media-graph engine (spec §7).
//!
//! Every error code follows the pattern `MGE-X###` where `X` is the category
//! letter and `###` is a three-digit number:
//!
//! - **V** — Validation errors (blueprint/config shape)
//! - **R** — Resolution errors (catalog/graph lookups)
//! - **X** — Runtime errors (planning/execution)
//! - **P** — Provider errors (external model handlers)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Enumeration of every stable error code the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // ── Validation (V) ───────────────────────────────────────────────
    /// The blueprint failed structural or semantic validation.
    BlueprintValidationFailed,
    /// A required blueprint input was not supplied in the inputs file.
    MissingRequiredInput,
    /// The engine configuration is invalid or incomplete.
    InvalidConfig,
    /// A `[dim]` segment referenced a loop name that was never declared.
    UnknownDimension,

    // ── Resolution (R) ───────────────────────────────────────────────
    /// An imported producer could not be found in the catalog.
    MissingProducerCatalogEntry,
    /// The inputs file named no `(provider, model)` option for a producer
    /// that requires one.
    NoProducerOptions,
    /// The artifact resolver could not locate a requested artifact.
    ArtifactResolutionFailed,
    /// An event referenced a blob that does not exist in the blob store.
    MissingBlobPayload,

    // ── Runtime (X) ──────────────────────────────────────────────────
    /// `reRunFrom` was requested with no prior manifest to re-run from.
    StageStartRequiresPredecessor,
    /// A job was short-circuited because a required upstream artifact failed.
    UpstreamFailure,
    /// The workspace root does not exist or is not writable.
    MissingStorageRoot,
    /// The requested manifest revision does not exist.
    MissingManifest,
    /// A resolved payload did not carry the timeline structure a provider
    /// expected.
    MissingTimeline,
    /// A timeline asset's blob could not be located.
    MissingTimelineBlob,
    /// A provider invocation failed during rendering.
    RenderFailed,
    /// The run was cancelled before completion.
    Cancelled,

    // ── Provider (P) ─────────────────────────────────────────────────
    /// A provider handler raised an error the core does not interpret.
    ProviderError,
}

impl ErrorCode {
    /// Machine-readable code string (e.g. `"MGE-V001"`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BlueprintValidationFailed => "MGE-V001",
            Self::MissingRequiredInput => "MGE-V002",
            Self::InvalidConfig => "MGE-V003",
            Self::UnknownDimension => "MGE-V004",

            Self::MissingProducerCatalogEntry => "MGE-R001",
            Self::NoProducerOptions => "MGE-R002",
            Self::ArtifactResolutionFailed => "MGE-R003",
            Self::MissingBlobPayload => "MGE-R004",

            Self::StageStartRequiresPredecessor => "MGE-X001",
            Self::UpstreamFailure => "MGE-X002",
            Self::MissingStorageRoot => "MGE-X003",
            Self::MissingManifest => "MGE-X004",
            Self::MissingTimeline => "MGE-X005",
            Self::MissingTimelineBlob => "MGE-X006",
            Self::RenderFailed => "MGE-X007",
            Self::Cancelled => "MGE-X008",

            Self::ProviderError => "MGE-P001",
        }
    }

    /// The taxonomy category this code belongs to.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::BlueprintValidationFailed
            | Self::MissingRequiredInput
            | Self::InvalidConfig
            | Self::UnknownDimension => "validation",

            Self::MissingProducerCatalogEntry
            | Self::NoProducerOptions
            | Self::ArtifactResolutionFailed
            | Self::MissingBlobPayload => "resolution",

            Self::StageStartRequiresPredecessor
            | Self::UpstreamFailure
            | Self::MissingStorageRoot
            | Self::MissingManifest
            | Self::MissingTimeline
            | Self::MissingTimelineBlob
            | Self::RenderFailed
            | Self::Cancelled => "runtime",

            Self::ProviderError => "provider",
        }
    }

    /// Short human-readable description of this error code.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::BlueprintValidationFailed => "The blueprint failed structural or semantic validation",
            Self::MissingRequiredInput => "A required blueprint input was not supplied in the inputs file",
            Self::InvalidConfig => "The engine configuration is invalid or incomplete",
            Self::UnknownDimension => "A dimension referenced a loop name that was never declared",

            Self::MissingProducerCatalogEntry => "An imported producer could not be found in the catalog",
            Self::NoProducerOptions => "No (provider, model) option was supplied for a producer that requires one",
            Self::ArtifactResolutionFailed => "The artifact resolver could not locate a requested artifact",
            Self::MissingBlobPayload => "An event referenced a blob that does not exist in the blob store",

            Self::StageStartRequiresPredecessor => "reRunFrom was requested with no prior manifest to re-run from",
            Self::UpstreamFailure => "A job was short-circuited because a required upstream artifact failed",
            Self::MissingStorageRoot => "The workspace root does not exist or is not writable",
            Self::MissingManifest => "The requested manifest revision does not exist",
            Self::MissingTimeline => "A resolved payload did not carry the timeline structure a provider expected",
            Self::MissingTimelineBlob => "A timeline asset's blob could not be located",
            Self::RenderFailed => "A provider invocation failed during rendering",
            Self::Cancelled => "The run was cancelled before completion",

            Self::ProviderError => "A provider handler raised an error the core does not interpret",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// All error codes, in definition order.
const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::BlueprintValidationFailed,
    ErrorCode::MissingRequiredInput,
    ErrorCode::InvalidConfig,
    ErrorCode::UnknownDimension,
    ErrorCode::MissingProducerCatalogEntry,
    ErrorCode::NoProducerOptions,
    ErrorCode::ArtifactResolutionFailed,
    ErrorCode::MissingBlobPayload,
    ErrorCode::StageStartRequiresPredecessor,
    ErrorCode::UpstreamFailure,
    ErrorCode::MissingStorageRoot,
    ErrorCode::MissingManifest,
    ErrorCode::MissingTimeline,
    ErrorCode::MissingTimelineBlob,
    ErrorCode::RenderFailed,
    ErrorCode::Cancelled,
    ErrorCode::ProviderError,
];

/// Static catalog providing lookup and enumeration of [`ErrorCode`]s.
pub struct ErrorCatalog;

impl ErrorCatalog {
    /// Look up an [`ErrorCode`] by its code string (e.g. `"MGE-V001"`).
    #[must_use]
    pub fn lookup(code: &str) -> Option<ErrorCode> {
        ALL_CODES.iter().find(|c| c.code() == code).copied()
    }

    /// Return every defined [`ErrorCode`].
    #[must_use]
    pub fn all() -> Vec<ErrorCode> {
        ALL_CODES.to_vec()
    }

    /// Return all codes belonging to `category` (e.g. `"runtime"`).
    #[must_use]
    pub fn by_category(category: &str) -> Vec<ErrorCode> {
        ALL_CODES
            .iter()
            .filter(|c| c.category() == category)
            .copied()
            .collect()
    }
}

/// Provider-originated context the core preserves but does not interpret.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

/// The top-level error type every public `mge-*` boundary returns.
///
/// Carries a stable [`ErrorCode`], a human message, arbitrary key-value
/// context, an optional `suggestion` hint, and — for provider-originated
/// failures — a [`ProviderContext`] passed through without interpretation.
#[derive(Debug, thiserror::Error)]
#[error("{}", self.render())]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub suggestion: Option<String>,
    pub provider: Option<ProviderContext>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    /// Start building an [`EngineError`] for the given code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            suggestion: None,
            provider: None,
            source: None,
        }
    }

    /// Add a key-value context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach an actionable suggestion hint.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach provider-originated context, passed through verbatim.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderContext) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Attach an underlying source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    fn render(&self) -> String {
        let mut s = format!("[{}] {}", self.code.code(), self.message);
        if !self.context.is_empty() {
            s.push_str(" (");
            let mut first = true;
            for (k, v) in &self.context {
                if !first {
                    s.push_str(", ");
                }
                s.push_str(&format!("{k}={v}"));
                first = false;
            }
            s.push(')');
        }
        if let Some(suggestion) = &self.suggestion {
            s.push_str(&format!(" — {suggestion}"));
        }
        s
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::new(ErrorCode::MissingStorageRoot, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::new(ErrorCode::BlueprintValidationFailed, err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_round_trips_through_the_catalog() {
        for code in ErrorCatalog::all() {
            let looked_up = ErrorCatalog::lookup(code.code());
            assert_eq!(looked_up, Some(code));
        }
    }

    #[test]
    fn codes_are_unique() {
        let codes: Vec<&str> = ErrorCatalog::all().iter().map(ErrorCode::code).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(codes.len(), sorted.len(), "duplicate error codes detected");
    }

    #[test]
    fn by_category_only_returns_matching_codes() {
        for code in ErrorCatalog::by_category("runtime") {
            assert_eq!(code.category(), "runtime");
        }
    }

    #[test]
    fn display_includes_code_message_and_context() {
        let err = EngineError::new(ErrorCode::UpstreamFailure, "job short-circuited")
            .with_context("jobId", "job-7")
            .with_suggestion("check the upstream artifact's last event");
        let rendered = err.to_string();
        assert!(rendered.contains("MGE-X002"));
        assert!(rendered.contains("jobId=job-7"));
        assert!(rendered.contains("check the upstream"));
    }

    #[test]
    fn descriptions_are_non_empty_for_every_code() {
        for code in ErrorCatalog::all() {
            assert!(!code.description().is_empty(), "{code:?} has empty description");
        }
    }
}
