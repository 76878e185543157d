//! Automatic recovery after a terminal generation failure.
//!
//! The failed request keeps its `error` status. Recovery creates a new
//! pending request (a restoration) seeded from the closest known-good
//! version of the same website, and enqueues it.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use sitegen_core::{DomainError, NewRequest, Request, RequestId, RequestStatus};

use crate::error::PipelineError;
use crate::jobs::JobQueue;
use crate::versioning::VersionChain;

/// Default bound on restorations spawned back-to-back from failed restorations.
pub const DEFAULT_MAX_CONSECUTIVE_RESTORATIONS: u32 = 2;

#[derive(Clone)]
pub struct RollbackController {
    chain: VersionChain,
    queue: Arc<dyn JobQueue>,
    max_consecutive_restorations: u32,
}

impl RollbackController {
    pub fn new(chain: VersionChain, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            chain,
            queue,
            max_consecutive_restorations: DEFAULT_MAX_CONSECUTIVE_RESTORATIONS,
        }
    }

    pub fn with_max_consecutive_restorations(mut self, max: u32) -> Self {
        self.max_consecutive_restorations = max;
        self
    }

    /// Spawn a restoration for `failed`, which must be in `error`.
    ///
    /// Returns `None` when the website has no other version to restore from,
    /// when `failed` already has a restoration, or when `failed` ends a chain
    /// of too many consecutive restorations.
    #[instrument(skip(self, failed), fields(request_id = %failed.id, website_id = %failed.website_id), err)]
    pub async fn restore(&self, failed: &Request) -> Result<Option<Request>, PipelineError> {
        let depth = self.restoration_depth(failed).await?;
        if depth >= self.max_consecutive_restorations {
            warn!(
                depth,
                max = self.max_consecutive_restorations,
                "restoration chain limit reached, leaving request failed"
            );
            return Ok(None);
        }

        let _guard = self.chain.lock(failed.website_id).await;

        let mut failed = self.chain.get(failed.id).await?;
        if failed.status != RequestStatus::Error {
            return Err(DomainError::invariant(format!(
                "request {} is {}, only failed requests are restored",
                failed.id, failed.status
            ))
            .into());
        }
        if let Some(existing) = failed.restored_by {
            debug!(restoration = %existing, "request already has a restoration");
            return Ok(None);
        }

        let group = self.chain.store().list_by_website(failed.website_id).await?;
        let Some(ancestor) = select_ancestor(&group, &failed) else {
            info!("no earlier version to restore from");
            return Ok(None);
        };

        let restoration = self
            .chain
            .append_locked(failed.website_id, |version| {
                NewRequest::restoration(ancestor, &failed, version)
            })
            .await?;

        if let Err(err) = self.link(&mut failed, restoration.id).await {
            self.abandon(&restoration, &err).await;
            return Err(err);
        }

        info!(
            restoration = %restoration.id,
            ancestor = %ancestor.id,
            version = restoration.version,
            "restoration request created"
        );
        Ok(Some(restoration))
    }

    /// Enqueue the restoration, then record it on the failed request.
    async fn link(&self, failed: &mut Request, restoration: RequestId) -> Result<(), PipelineError> {
        self.queue.publish(restoration)?;
        failed.mark_restored_by(restoration)?;
        self.chain.store().save(failed).await?;
        Ok(())
    }

    /// Fail a restoration that could not be enqueued or linked to its failed
    /// request, so that no delivery or recovery pass ever runs it.
    /// The caller holds the website lock.
    async fn abandon(&self, restoration: &Request, cause: &PipelineError) {
        let message = format!("rollback did not complete: {cause}");
        match self.chain.fail_locked(restoration.id, &message).await {
            Ok(_) => warn!(restoration = %restoration.id, error = %cause, "restoration abandoned"),
            Err(err) => error!(
                restoration = %restoration.id,
                error = %err,
                "failed to abandon restoration, it stays pending"
            ),
        }
    }

    /// Number of restorations chained behind `failed` via `restoration_of`.
    async fn restoration_depth(&self, failed: &Request) -> Result<u32, PipelineError> {
        let mut depth = 0;
        let mut cursor = failed.restoration_of;
        while let Some(id) = cursor {
            depth += 1;
            if depth >= self.max_consecutive_restorations {
                break;
            }
            cursor = self.chain.store().get(id).await?.and_then(|r| r.restoration_of);
        }
        Ok(depth)
    }
}

/// The live head if there is one besides `failed`, else the highest other version.
fn select_ancestor<'a>(group: &'a [Request], failed: &Request) -> Option<&'a Request> {
    let others = || group.iter().filter(|r| r.id != failed.id);
    others()
        .filter(|r| r.status == RequestStatus::Completed)
        .max_by_key(|r| r.version)
        .or_else(|| others().max_by_key(|r| r.version))
}

#[cfg(test)]
mod tests {
    use sitegen_core::{AccountId, FileBundle};

    use super::*;
    use crate::jobs::{InMemoryJobQueue, JobReceiver, QueueError};
    use crate::requests::InMemoryRequestStore;

    fn setup() -> (VersionChain, RollbackController, JobReceiver) {
        let chain = VersionChain::new(Arc::new(InMemoryRequestStore::new()));
        let (queue, receiver) = InMemoryJobQueue::new();
        let rollback = RollbackController::new(chain.clone(), Arc::new(queue));
        (chain, rollback, receiver)
    }

    #[tokio::test]
    async fn restores_from_the_live_head() {
        let (chain, rollback, mut receiver) = setup();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        let a = FileBundle::new().with_file("a.html", "A");
        chain.promote(v1.id, a.clone()).await.unwrap();
        let v2 = chain.append_edit(v1.id, "add a shop").await.unwrap();
        let v2 = chain.fail(v2.id, "backend down").await.unwrap().unwrap();

        let v3 = rollback.restore(&v2).await.unwrap().unwrap();

        assert_eq!(v3.version, 3);
        assert_eq!(v3.status, RequestStatus::Pending);
        assert_eq!(v3.generated_files, Some(a));
        assert_eq!(v3.original_request, Some(v1.id));
        assert_eq!(v3.restoration_of, Some(v2.id));
        assert_eq!(receiver.drain(), vec![v3.id]);

        let v2 = chain.get(v2.id).await.unwrap();
        assert_eq!(v2.status, RequestStatus::Error);
        assert_eq!(v2.restored_by, Some(v3.id));

        // Only once per failed request.
        assert!(rollback.restore(&v2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_version_failure_has_nothing_to_restore() {
        let (chain, rollback, mut receiver) = setup();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        let v1 = chain.fail(v1.id, "backend down").await.unwrap().unwrap();

        assert!(rollback.restore(&v1).await.unwrap().is_none());
        assert!(receiver.drain().is_empty());
        assert_eq!(chain.next_version(v1.website_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejects_requests_that_did_not_fail() {
        let (chain, rollback, _receiver) = setup();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();

        let err = rollback.restore(&v1).await.unwrap_err();
        assert!(matches!(err, PipelineError::Domain(DomainError::InvariantViolation(_))));
    }

    struct ClosedQueue;

    impl JobQueue for ClosedQueue {
        fn publish(&self, _request_id: RequestId) -> Result<(), QueueError> {
            Err(QueueError::Closed)
        }
    }

    #[tokio::test]
    async fn unpublished_restoration_is_abandoned() {
        let chain = VersionChain::new(Arc::new(InMemoryRequestStore::new()));
        let rollback = RollbackController::new(chain.clone(), Arc::new(ClosedQueue));
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        chain
            .promote(v1.id, FileBundle::new().with_file("a.html", "A"))
            .await
            .unwrap();
        let v2 = chain.append_edit(v1.id, "add a shop").await.unwrap();
        let v2 = chain.fail(v2.id, "backend down").await.unwrap().unwrap();

        let err = rollback.restore(&v2).await.unwrap_err();
        assert!(matches!(err, PipelineError::Queue(QueueError::Closed)));

        let v2 = chain.get(v2.id).await.unwrap();
        assert_eq!(v2.status, RequestStatus::Error);
        assert_eq!(v2.restored_by, None);

        let pending = chain
            .store()
            .list_by_status(RequestStatus::Pending, usize::MAX)
            .await
            .unwrap();
        assert!(pending.is_empty());
        let group = chain.store().list_by_website(v1.website_id).await.unwrap();
        let abandoned = group.iter().find(|r| r.restoration_of == Some(v2.id)).unwrap();
        assert_eq!(abandoned.status, RequestStatus::Error);
    }

    #[tokio::test]
    async fn stops_after_consecutive_failed_restorations() {
        let (chain, rollback, _receiver) = setup();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        chain
            .promote(v1.id, FileBundle::new().with_file("a.html", "A"))
            .await
            .unwrap();
        let v2 = chain.append_edit(v1.id, "add a shop").await.unwrap();
        let v2 = chain.fail(v2.id, "down").await.unwrap().unwrap();

        let v3 = rollback.restore(&v2).await.unwrap().unwrap();
        let v3 = chain.fail(v3.id, "down").await.unwrap().unwrap();
        let v4 = rollback.restore(&v3).await.unwrap().unwrap();
        let v4 = chain.fail(v4.id, "down").await.unwrap().unwrap();

        assert!(rollback.restore(&v4).await.unwrap().is_none());
        assert_eq!(chain.next_version(v1.website_id).await.unwrap(), 5);
    }
}
