//! Website operations called by the intake boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use sitegen_core::{AccountId, NewRequest, Request, RequestId, RequestStatus, WebsiteId};

use crate::error::PipelineError;
use crate::jobs::JobQueue;
use crate::versioning::VersionChain;

/// Input for a brand-new website.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSite {
    pub account_id: AccountId,
    pub content: String,
    pub website_type: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

impl NewSite {
    pub fn new(account_id: AccountId, content: impl Into<String>) -> Self {
        Self {
            account_id,
            content: content.into(),
            website_type: None,
            features: Vec::new(),
        }
    }
}

/// What a client polling a request sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub request_id: RequestId,
    pub website_id: WebsiteId,
    pub version: u32,
    pub status: RequestStatus,
    pub error: Option<String>,
    /// The request failed and a restoration was spawned for it.
    pub restoration_initiated: bool,
    pub restored_by: Option<RequestId>,
    pub has_files: bool,
}

impl From<&Request> for StatusView {
    fn from(request: &Request) -> Self {
        Self {
            request_id: request.id,
            website_id: request.website_id,
            version: request.version,
            status: request.status,
            error: request.error.clone(),
            restoration_initiated: request.status == RequestStatus::Error
                && request.restored_by.is_some(),
            restored_by: request.restored_by,
            has_files: request
                .generated_files
                .as_ref()
                .is_some_and(|files| !files.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct SiteService {
    chain: VersionChain,
    queue: Arc<dyn JobQueue>,
}

impl SiteService {
    pub fn new(chain: VersionChain, queue: Arc<dyn JobQueue>) -> Self {
        Self { chain, queue }
    }

    /// Version 1 of a new website, pending and enqueued.
    #[instrument(skip(self, site), fields(account_id = %site.account_id), err)]
    pub async fn create_site(&self, site: NewSite) -> Result<Request, PipelineError> {
        let mut new = NewRequest::fresh(site.account_id, site.content).with_features(site.features);
        new.website_type = site.website_type;

        let request = self.chain.create(new).await?;
        self.queue.publish(request.id)?;
        Ok(request)
    }

    /// Next version of the parent's website, editing the parent's files.
    /// The parent stays live until the edit completes.
    #[instrument(skip(self, instruction), err)]
    pub async fn submit_modification(
        &self,
        parent_id: RequestId,
        instruction: &str,
    ) -> Result<Request, PipelineError> {
        let request = self.chain.append_edit(parent_id, instruction).await?;
        self.queue.publish(request.id)?;
        Ok(request)
    }

    /// Make an archived version live again.
    pub async fn restore_version(&self, request_id: RequestId) -> Result<Request, PipelineError> {
        self.chain.restore_version(request_id).await
    }

    pub async fn status(&self, request_id: RequestId) -> Result<StatusView, PipelineError> {
        let request = self.chain.get(request_id).await?;
        Ok(StatusView::from(&request))
    }

    /// All versions of a website, oldest first.
    pub async fn history(&self, website_id: WebsiteId) -> Result<Vec<Request>, PipelineError> {
        Ok(self.chain.store().list_by_website(website_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use sitegen_core::{DomainError, FileBundle};

    use super::*;
    use crate::jobs::InMemoryJobQueue;
    use crate::requests::InMemoryRequestStore;

    #[tokio::test]
    async fn create_and_modify_enqueue_each_version() {
        let chain = VersionChain::new(Arc::new(InMemoryRequestStore::new()));
        let (queue, mut receiver) = InMemoryJobQueue::new();
        let sites = SiteService::new(chain.clone(), Arc::new(queue));

        let mut site = NewSite::new(AccountId::new(), "a bakery site");
        site.website_type = Some("business".into());
        let v1 = sites.create_site(site).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.website_type.as_deref(), Some("business"));

        chain
            .promote(v1.id, FileBundle::new().with_file("index.html", "bread"))
            .await
            .unwrap();
        let v2 = sites
            .submit_modification(v1.id, "add opening hours")
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.original_request, Some(v1.id));
        assert_eq!(receiver.drain(), vec![v1.id, v2.id]);

        let view = sites.status(v1.id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Completed);
        assert!(view.has_files);
        assert!(!view.restoration_initiated);

        let history = sites.history(v1.website_id).await.unwrap();
        assert_eq!(
            history.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let chain = VersionChain::new(Arc::new(InMemoryRequestStore::new()));
        let (queue, _receiver) = InMemoryJobQueue::new();
        let sites = SiteService::new(chain, Arc::new(queue));

        let err = sites
            .create_site(NewSite::new(AccountId::new(), "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Domain(DomainError::Validation(_))));

        let missing = RequestId::new(404);
        let err = sites.submit_modification(missing, "x").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(id) if id == missing));
        assert!(matches!(sites.status(missing).await, Err(PipelineError::NotFound(_))));
    }
}
