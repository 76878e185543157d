//! Request storage: the only shared mutable resource of the pipeline.
//!
//! Every write is conditional on the row revision the caller last read
//! (compare-and-swap), and batches are all-or-nothing. Stores also refuse a
//! second `completed` row for the same website and a duplicate
//! `(website_id, version)` pair, so the version-chain invariants hold even if
//! a caller forgets to take the website lock.

pub mod postgres;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use sitegen_core::{ExpectedRevision, NewRequest, Request, RequestId, RequestStatus, WebsiteId};

pub use postgres::PostgresRequestStore;

/// Request store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("request not found: {0}")]
    NotFound(RequestId),
    /// Stale revision, duplicate version, or a second live head.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Request store abstraction.
#[async_trait]
pub trait RequestStore: Send + Sync + 'static {
    /// Persist a new pending request; the store assigns its id.
    async fn insert(&self, new: NewRequest) -> Result<Request, StoreError>;

    async fn get(&self, id: RequestId) -> Result<Option<Request>, StoreError>;

    /// All versions of a website, ordered by version.
    async fn list_by_website(&self, website_id: WebsiteId) -> Result<Vec<Request>, StoreError>;

    /// Requests in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<Request>, StoreError>;

    async fn max_version(&self, website_id: WebsiteId) -> Result<Option<u32>, StoreError>;

    /// Atomically write a batch of requests.
    ///
    /// Each request's `revision` is the revision the caller read; the write
    /// fails with [`StoreError::Conflict`] if any row moved on. Returns the
    /// rows as stored (with bumped revisions), in input order.
    async fn save_all(&self, requests: &[Request]) -> Result<Vec<Request>, StoreError>;

    async fn save(&self, request: &Request) -> Result<Request, StoreError> {
        let mut saved = self.save_all(std::slice::from_ref(request)).await?;
        saved
            .pop()
            .ok_or_else(|| StoreError::Storage("empty save result".to_string()))
    }
}

#[derive(Debug, Default)]
struct Rows {
    requests: HashMap<RequestId, Request>,
    last_id: i64,
}

/// In-memory request store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    rows: RwLock<Rows>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, new: NewRequest) -> Result<Request, StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        let taken = rows
            .requests
            .values()
            .any(|r| r.website_id == new.website_id && r.version == new.version);
        if taken {
            return Err(StoreError::Conflict(format!(
                "version {} already exists for website {}",
                new.version, new.website_id
            )));
        }

        rows.last_id += 1;
        let request = Request::from_new(RequestId::new(rows.last_id), new, 1, Utc::now());
        rows.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.requests.get(&id).cloned())
    }

    async fn list_by_website(&self, website_id: WebsiteId) -> Result<Vec<Request>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = rows
            .requests
            .values()
            .filter(|r| r.website_id == website_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.version);
        Ok(result)
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<Request>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = rows
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.id);
        result.truncate(limit);
        Ok(result)
    }

    async fn max_version(&self, website_id: WebsiteId) -> Result<Option<u32>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .requests
            .values()
            .filter(|r| r.website_id == website_id)
            .map(|r| r.version)
            .max())
    }

    async fn save_all(&self, requests: &[Request]) -> Result<Vec<Request>, StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        // Validate the whole batch before touching anything.
        for request in requests {
            let current = rows
                .requests
                .get(&request.id)
                .ok_or(StoreError::NotFound(request.id))?;
            if !ExpectedRevision::Exact(request.revision).matches(current.revision) {
                return Err(StoreError::Conflict(format!(
                    "request {} is at revision {}, write expected {}",
                    request.id, current.revision, request.revision
                )));
            }
        }

        let batch_ids: HashSet<RequestId> = requests.iter().map(|r| r.id).collect();
        let websites: HashSet<WebsiteId> = requests.iter().map(|r| r.website_id).collect();
        for website_id in websites {
            let untouched_live = rows
                .requests
                .values()
                .filter(|r| r.website_id == website_id && !batch_ids.contains(&r.id))
                .filter(|r| r.status == RequestStatus::Completed)
                .count();
            let batch_live = requests
                .iter()
                .filter(|r| r.website_id == website_id && r.status == RequestStatus::Completed)
                .count();
            if untouched_live + batch_live > 1 {
                return Err(StoreError::Conflict(format!(
                    "website {website_id} would have more than one completed version"
                )));
            }
        }

        let now = Utc::now();
        let mut saved = Vec::with_capacity(requests.len());
        for request in requests {
            let mut stored = request.clone();
            stored.revision += 1;
            stored.updated_at = now;
            rows.requests.insert(stored.id, stored.clone());
            saved.push(stored);
        }
        Ok(saved)
    }
}
