//! Postgres-backed request store.
//!
//! ## Conditional writes
//!
//! `save_all` runs in one transaction. Each row is updated with
//! `WHERE id = $1 AND revision = $2`; a missing row turns into `NotFound` or
//! `Conflict` and the transaction is rolled back. Rows leaving `completed` are
//! written before rows entering it, so the partial unique index
//! `generation_requests_one_live_head` never sees two live heads mid-batch.
//!
//! ## Error mapping
//!
//! | SQLx error | Code | StoreError |
//! |---|---|---|
//! | unique violation | `23505` | `Conflict` |
//! | check / foreign key violation | `23514`, `23503` | `Storage` |
//! | anything else | | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use sitegen_core::{
    AccountId, FileBundle, NewRequest, Request, RequestId, RequestStatus, WebsiteId,
};

use super::{RequestStore, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_generation_pipeline.sql");

const SELECT_COLUMNS: &str = r#"
    id, website_id, account_id, version, status, content, modification_request,
    original_request, generated_files, error, website_type, features, deployed,
    domain_name, restoration_of, restored_by, revision, created_at, updated_at
"#;

/// Postgres-backed request store.
#[derive(Debug, Clone)]
pub struct PostgresRequestStore {
    pool: Arc<PgPool>,
}

impl PostgresRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn update_row(
        tx: &mut Transaction<'_, Postgres>,
        request: &Request,
    ) -> Result<Request, StoreError> {
        let sql = format!(
            r#"
            UPDATE generation_requests SET
                status = $3,
                content = $4,
                modification_request = $5,
                original_request = $6,
                generated_files = $7,
                error = $8,
                website_type = $9,
                features = $10,
                deployed = $11,
                domain_name = $12,
                restoration_of = $13,
                restored_by = $14,
                revision = revision + 1,
                updated_at = now()
            WHERE id = $1 AND revision = $2
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(request.id.get())
            .bind(request.revision as i64)
            .bind(request.status.as_str())
            .bind(&request.content)
            .bind(&request.modification_request)
            .bind(request.original_request.map(RequestId::get))
            .bind(request.generated_files.as_ref().map(Json))
            .bind(&request.error)
            .bind(&request.website_type)
            .bind(Json(&request.features))
            .bind(request.deployed)
            .bind(&request.domain_name)
            .bind(request.restoration_of.map(RequestId::get))
            .bind(request.restored_by.map(RequestId::get))
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;

        match row {
            Some(row) => request_from_row(&row),
            None => {
                let exists = sqlx::query("SELECT revision FROM generation_requests WHERE id = $1")
                    .bind(request.id.get())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("save", e))?;
                match exists {
                    Some(row) => {
                        let actual: i64 = row
                            .try_get("revision")
                            .map_err(|e| map_sqlx_error("save", e))?;
                        Err(StoreError::Conflict(format!(
                            "request {} is at revision {actual}, write expected {}",
                            request.id, request.revision
                        )))
                    }
                    None => Err(StoreError::NotFound(request.id)),
                }
            }
        }
    }
}

#[async_trait]
impl RequestStore for PostgresRequestStore {
    #[instrument(skip(self, new), fields(website_id = %new.website_id, version = new.version), err)]
    async fn insert(&self, new: NewRequest) -> Result<Request, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO generation_requests
                (website_id, account_id, version, status, content, modification_request,
                 original_request, generated_files, website_type, features, restoration_of)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, $10)
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(new.website_id.as_uuid())
            .bind(new.account_id.as_uuid())
            .bind(new.version as i32)
            .bind(&new.content)
            .bind(&new.modification_request)
            .bind(new.original_request.map(RequestId::get))
            .bind(new.generated_files.as_ref().map(Json))
            .bind(&new.website_type)
            .bind(Json(&new.features))
            .bind(new.restoration_of.map(RequestId::get))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        request_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM generation_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(request_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_by_website(&self, website_id: WebsiteId) -> Result<Vec<Request>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM generation_requests WHERE website_id = $1 ORDER BY version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(website_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_website", e))?;

        rows.iter().map(request_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<Request>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM generation_requests WHERE status = $1 ORDER BY id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(request_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn max_version(&self, website_id: WebsiteId) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query("SELECT MAX(version) AS max_version FROM generation_requests WHERE website_id = $1")
            .bind(website_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("max_version", e))?;

        let max: Option<i32> = row
            .try_get("max_version")
            .map_err(|e| map_sqlx_error("max_version", e))?;
        Ok(max.map(|v| v as u32))
    }

    #[instrument(skip(self, requests), fields(batch = requests.len()), err)]
    async fn save_all(&self, requests: &[Request]) -> Result<Vec<Request>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Leaving `completed` first, entering it last.
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by_key(|&i| requests[i].status == RequestStatus::Completed);

        let mut saved: Vec<Option<Request>> = vec![None; requests.len()];
        for i in order {
            saved[i] = Some(Self::update_row(&mut tx, &requests[i]).await?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(saved.into_iter().flatten().collect())
    }
}

fn request_from_row(row: &sqlx::postgres::PgRow) -> Result<Request, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Storage(format!("failed to decode request row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<RequestStatus>()
        .map_err(|e| StoreError::Storage(e.to_string()))?;
    let website_id: Uuid = row.try_get("website_id").map_err(decode)?;
    let account_id: Uuid = row.try_get("account_id").map_err(decode)?;
    let version: i32 = row.try_get("version").map_err(decode)?;
    let generated_files: Option<Json<FileBundle>> = row.try_get("generated_files").map_err(decode)?;
    let features: Json<Vec<String>> = row.try_get("features").map_err(decode)?;
    let revision: i64 = row.try_get("revision").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;
    let original_request: Option<i64> = row.try_get("original_request").map_err(decode)?;
    let restoration_of: Option<i64> = row.try_get("restoration_of").map_err(decode)?;
    let restored_by: Option<i64> = row.try_get("restored_by").map_err(decode)?;

    Ok(Request {
        id: RequestId::new(row.try_get("id").map_err(decode)?),
        website_id: WebsiteId::from_uuid(website_id),
        account_id: AccountId::from_uuid(account_id),
        version: version as u32,
        status,
        content: row.try_get("content").map_err(decode)?,
        modification_request: row.try_get("modification_request").map_err(decode)?,
        original_request: original_request.map(RequestId::new),
        generated_files: generated_files.map(|Json(files)| files),
        error: row.try_get("error").map_err(decode)?,
        website_type: row.try_get("website_type").map_err(decode)?,
        features: features.0,
        deployed: row.try_get("deployed").map_err(decode)?,
        domain_name: row.try_get("domain_name").map_err(decode)?,
        restoration_of: restoration_of.map(RequestId::new),
        restored_by: restored_by.map(RequestId::new),
        revision: revision as u64,
        created_at,
        updated_at,
    })
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed during {operation}"))
        }
        other => StoreError::Storage(format!("{operation} failed: {other}")),
    }
}
