//! Plan Store (spec §4.N): persists and loads `ExecutionPlan` JSON at
//! `runs/<revision>-plan.json`, with stable key order for human diffing.
#![deny(unsafe_code)]

use mge_core::{ExecutionPlan, Revision};
use mge_storage::{StorageBackend, StorageError, WriteOptions};

/// Errors raised while persisting or loading a plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanStoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Persists and loads `ExecutionPlan` JSON, scoped to one movie's storage.
pub struct PlanStore<'a, B: StorageBackend> {
    storage: &'a mge_storage::MovieStorage<B>,
}

impl<'a, B: StorageBackend> PlanStore<'a, B> {
    #[must_use]
    pub fn new(storage: &'a mge_storage::MovieStorage<B>) -> Self {
        Self { storage }
    }

    /// Write `plan` to `runs/<revision>-plan.json`.
    pub async fn save(&self, plan: &ExecutionPlan) -> Result<(), PlanStoreError> {
        let path = plan_path(plan.revision);
        let bytes = serde_json::to_vec_pretty(plan)?;
        self.storage.write(&path, bytes, WriteOptions::default()).await?;
        Ok(())
    }

    /// Read and parse the plan persisted for `revision`.
    pub async fn load(&self, revision: Revision) -> Result<ExecutionPlan, PlanStoreError> {
        let path = plan_path(revision);
        let raw = self.storage.read_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// `true` if a plan file exists for `revision`.
    pub async fn exists(&self, revision: Revision) -> Result<bool, PlanStoreError> {
        Ok(self.storage.exists(&plan_path(revision)).await?)
    }
}

fn plan_path(revision: Revision) -> String {
    format!("runs/{revision}-plan.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mge_storage::MemoryBackend;

    fn empty_plan(revision: Revision) -> ExecutionPlan {
        ExecutionPlan {
            revision,
            manifest_base_hash: "basehash".to_string(),
            layers: vec![],
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = PlanStore::new(&storage);

        let plan = empty_plan(Revision::new(3));
        store.save(&plan).await.unwrap();
        assert!(store.exists(Revision::new(3)).await.unwrap());

        let loaded = store.load(Revision::new(3)).await.unwrap();
        assert_eq!(loaded.manifest_base_hash, "basehash");
        assert_eq!(loaded.revision, Revision::new(3));
    }

    #[tokio::test]
    async fn load_missing_revision_errors() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = PlanStore::new(&storage);
        let err = store.load(Revision::new(9)).await.unwrap_err();
        assert!(matches!(err, PlanStoreError::Storage(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn written_plan_is_human_diffable_pretty_json() {
        let backend = MemoryBackend::new();
        let storage = mge_storage::MovieStorage::new(backend, "movies", "m1");
        let store = PlanStore::new(&storage);
        store.save(&empty_plan(Revision::new(1))).await.unwrap();
        let raw = storage.read_string("runs/rev-0001-plan.json").await.unwrap();
        assert!(raw.contains('\n'), "expected pretty-printed, multi-line JSON");
    }
}
