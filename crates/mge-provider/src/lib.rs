//! Provider Boundary (spec §4.O): the narrow async interface the Runner
//! invokes to produce artifacts, plus the `(provider, model, environment)`
//! registry that resolves handlers and a simulated-mode stub.
#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use mge_core::{ArtifactStatus, CanonicalId, ProducerJobContext};
use serde::{Deserialize, Serialize};

/// Errors surfaced by a provider invocation or by registry resolution.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No handler is registered for the requested `(provider, model,
    /// environment)` tuple.
    #[error("no provider handler registered for provider={provider:?} model={model:?} environment={environment:?}")]
    NoHandler {
        provider: String,
        model: String,
        environment: String,
    },
    /// The provider handler itself failed.
    #[error("provider invocation failed: {message}")]
    Invocation {
        message: String,
        provider: Option<String>,
        model: Option<String>,
        provider_request_id: Option<String>,
        recoverable: Option<bool>,
    },
}

/// Either in-memory bytes or a readable path, with a declared MIME type —
/// what a provider hands back for a produced artifact.
#[derive(Debug, Clone)]
pub enum BlobInput {
    Bytes { bytes: Vec<u8>, mime_type: String },
    Path { path: std::path::PathBuf, mime_type: String },
}

/// One artifact result within a [`InvokeResponse`].
#[derive(Debug, Clone)]
pub struct ArtefactResult {
    pub artefact_id: CanonicalId,
    pub status: ArtifactStatus,
    pub blob: Option<BlobInput>,
    pub diagnostics: Option<serde_json::Value>,
}

/// Everything the Provider Boundary passes into a handler invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub job_id: String,
    pub producer_alias: String,
    pub provider: String,
    pub model: String,
    pub revision: String,
    pub layer_index: usize,
    pub attempt: u32,
    pub inputs: Vec<CanonicalId>,
    pub produces: Vec<CanonicalId>,
    pub context: ProducerJobContext,
}

/// A handler's response to one [`InvokeRequest`].
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub status: ArtifactStatus,
    pub artefacts: Vec<ArtefactResult>,
    pub diagnostics: Option<serde_json::Value>,
}

/// A provider/model handler invoked by the Runner.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Perform the work described by `request`, observing `cancelled` as a
    /// best-effort cooperative cancellation signal.
    async fn invoke(
        &self,
        request: InvokeRequest,
        cancelled: Arc<tokio::sync::Notify>,
    ) -> Result<InvokeResponse, ProviderError>;
}

/// Sortable key identifying a registered handler: `(provider, model,
/// environment)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    pub provider: String,
    pub model: String,
    pub environment: String,
}

impl ProviderKey {
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            environment: environment.into(),
        }
    }
}

/// Registry of provider handlers, keyed by the stable sortable
/// `(provider, model, environment)` tuple rather than a hashed key
/// (mirrors the teacher's backend-entry registry discipline).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    handlers: BTreeMap<ProviderKey, Arc<dyn ProviderHandler>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, key: ProviderKey, handler: Arc<dyn ProviderHandler>) {
        self.handlers.insert(key, handler);
    }

    /// Resolve a handler for the given tuple.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NoHandler`] if nothing is registered.
    pub fn resolve(&self, provider: &str, model: &str, environment: &str) -> Result<Arc<dyn ProviderHandler>, ProviderError> {
        let key = ProviderKey::new(provider, model, environment);
        self.handlers
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::NoHandler {
                provider: provider.to_string(),
                model: model.to_string(),
                environment: environment.to_string(),
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A stub handler used in `simulated` mode: synthesizes empty-but-typed
/// JSON blobs for every declared output instead of calling out to a real
/// provider.
pub struct SimulatedHandler;

#[async_trait]
impl ProviderHandler for SimulatedHandler {
    async fn invoke(
        &self,
        request: InvokeRequest,
        _cancelled: Arc<tokio::sync::Notify>,
    ) -> Result<InvokeResponse, ProviderError> {
        let artefacts = request
            .produces
            .iter()
            .map(|id| ArtefactResult {
                artefact_id: id.clone(),
                status: ArtifactStatus::Succeeded,
                blob: Some(BlobInput::Bytes {
                    bytes: b"{}".to_vec(),
                    mime_type: "application/json".to_string(),
                }),
                diagnostics: None,
            })
            .collect();
        Ok(InvokeResponse {
            status: ArtifactStatus::Succeeded,
            artefacts,
            diagnostics: None,
        })
    }
}

/// Build a registry whose every entry resolves to [`SimulatedHandler`], for
/// `simulated` mode workspaces (spec §6, engine config `simulated = true`).
#[must_use]
pub fn simulated_registry(keys: impl IntoIterator<Item = ProviderKey>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let handler: Arc<dyn ProviderHandler> = Arc::new(SimulatedHandler);
    for key in keys {
        registry.register(key, handler.clone());
    }
    registry
}

impl std::fmt::Debug for dyn ProviderHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProviderHandler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl ProviderHandler for EchoHandler {
        async fn invoke(
            &self,
            request: InvokeRequest,
            _cancelled: Arc<tokio::sync::Notify>,
        ) -> Result<InvokeResponse, ProviderError> {
            Ok(InvokeResponse {
                status: ArtifactStatus::Succeeded,
                artefacts: request
                    .produces
                    .into_iter()
                    .map(|id| ArtefactResult {
                        artefact_id: id,
                        status: ArtifactStatus::Succeeded,
                        blob: None,
                        diagnostics: None,
                    })
                    .collect(),
                diagnostics: None,
            })
        }
    }

    fn dummy_context() -> ProducerJobContext {
        ProducerJobContext {
            namespace_path: "Script".to_string(),
            indices: vec![],
            input_bindings: BTreeMap::new(),
            fan_in: BTreeMap::new(),
            conditions: BTreeMap::new(),
            provider_mapping: None,
            declared_outputs: vec![],
            extras: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn registry_resolves_registered_handler() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            ProviderKey::new("acme", "v1", "prod"),
            Arc::new(EchoHandler),
        );
        let handler = registry.resolve("acme", "v1", "prod").unwrap();
        let request = InvokeRequest {
            job_id: "Producer:Script".to_string(),
            producer_alias: "Script".to_string(),
            provider: "acme".to_string(),
            model: "v1".to_string(),
            revision: "rev-0001".to_string(),
            layer_index: 0,
            attempt: 1,
            inputs: vec![],
            produces: vec!["Artifact:Script.NarrationScript".parse().unwrap()],
            context: dummy_context(),
        };
        let response = handler.invoke(request, Arc::new(tokio::sync::Notify::new())).await.unwrap();
        assert_eq!(response.artefacts.len(), 1);
    }

    #[test]
    fn registry_resolve_fails_for_unknown_tuple() {
        let registry = ProviderRegistry::new();
        let err = registry.resolve("acme", "v1", "prod").unwrap_err();
        assert!(matches!(err, ProviderError::NoHandler { .. }));
    }

    #[tokio::test]
    async fn simulated_registry_synthesizes_typed_blobs() {
        let key = ProviderKey::new("acme", "v1", "simulated");
        let registry = simulated_registry([key.clone()]);
        let handler = registry.resolve(&key.provider, &key.model, &key.environment).unwrap();
        let request = InvokeRequest {
            job_id: "Producer:Script".to_string(),
            producer_alias: "Script".to_string(),
            provider: key.provider,
            model: key.model,
            revision: "rev-0001".to_string(),
            layer_index: 0,
            attempt: 1,
            inputs: vec![],
            produces: vec!["Artifact:Script.NarrationScript".parse().unwrap()],
            context: dummy_context(),
        };
        let response = handler.invoke(request, Arc::new(tokio::sync::Notify::new())).await.unwrap();
        assert!(matches!(response.artefacts[0].blob, Some(BlobInput::Bytes { .. })));
    }
}
