//! Storage for generated file bundles, keyed by request id.

pub mod postgres;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use sitegen_core::{FileBundle, RequestId};

pub use postgres::PostgresArtifactStore;

/// Artifact store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactError {
    #[error("no artifacts stored for request {0}")]
    NotFound(RequestId),
    #[error("artifact storage error: {0}")]
    Storage(String),
}

/// Artifact store abstraction.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Replace the whole bundle for `request_id`. Saving the same bundle twice
    /// is a no-op; readers never observe a partially written bundle.
    async fn save(&self, request_id: RequestId, files: &FileBundle) -> Result<(), ArtifactError>;

    async fn get(&self, request_id: RequestId) -> Result<FileBundle, ArtifactError>;
}

/// Overlay the files a modification returned on top of the previous bundle.
pub fn merge(existing: &FileBundle, incoming: &FileBundle) -> FileBundle {
    existing.merge(incoming)
}

/// In-memory artifact store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    bundles: RwLock<HashMap<RequestId, FileBundle>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save(&self, request_id: RequestId, files: &FileBundle) -> Result<(), ArtifactError> {
        let mut bundles = self
            .bundles
            .write()
            .map_err(|_| ArtifactError::Storage("lock poisoned".to_string()))?;
        bundles.insert(request_id, files.clone());
        Ok(())
    }

    async fn get(&self, request_id: RequestId) -> Result<FileBundle, ArtifactError> {
        let bundles = self
            .bundles
            .read()
            .map_err(|_| ArtifactError::Storage("lock poisoned".to_string()))?;
        bundles
            .get(&request_id)
            .cloned()
            .ok_or(ArtifactError::NotFound(request_id))
    }
}
