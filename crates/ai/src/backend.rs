use async_trait::async_trait;

use sitegen_core::FileBundle;

use crate::error::BackendError;

/// An external website generator (typically an LLM-backed API).
///
/// Implementations are storage-agnostic and stateless from the pipeline's point
/// of view: given a prompt and, for edits, the current files, they return a new
/// bundle. A modification may return only the files it changed; the caller
/// merges them over `existing_files`.
#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        existing_files: Option<&FileBundle>,
    ) -> Result<FileBundle, BackendError>;
}
