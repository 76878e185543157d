//! Postgres-backed artifact store (`request_artifacts`, one JSONB bundle per row).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use sitegen_core::{FileBundle, RequestId};

use super::{ArtifactError, ArtifactStore};

#[derive(Debug, Clone)]
pub struct PostgresArtifactStore {
    pool: Arc<PgPool>,
}

impl PostgresArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ArtifactStore for PostgresArtifactStore {
    #[instrument(skip(self, files), fields(files = files.len()), err)]
    async fn save(&self, request_id: RequestId, files: &FileBundle) -> Result<(), ArtifactError> {
        // Single-statement upsert: the bundle is replaced as a whole.
        sqlx::query(
            r#"
            INSERT INTO request_artifacts (request_id, files, saved_at)
            VALUES ($1, $2, now())
            ON CONFLICT (request_id) DO UPDATE SET
                files = EXCLUDED.files,
                saved_at = EXCLUDED.saved_at
            "#,
        )
        .bind(request_id.get())
        .bind(Json(files))
        .execute(&*self.pool)
        .await
        .map_err(|e| ArtifactError::Storage(format!("save failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, request_id: RequestId) -> Result<FileBundle, ArtifactError> {
        let row = sqlx::query("SELECT files FROM request_artifacts WHERE request_id = $1")
            .bind(request_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| ArtifactError::Storage(format!("get failed: {e}")))?
            .ok_or(ArtifactError::NotFound(request_id))?;

        let Json(files): Json<FileBundle> = row
            .try_get("files")
            .map_err(|e| ArtifactError::Storage(format!("failed to decode bundle: {e}")))?;
        Ok(files)
    }
}
