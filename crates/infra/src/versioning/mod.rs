//! Version chain: ordering, lineage and the single-live-head rule per website.
//!
//! Every read-modify-write on a website's versions or statuses runs under
//! that website's async lock. The request store's conditional writes sit
//! underneath, so a writer that skips the lock still cannot produce a
//! duplicate version or a second `completed` row.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument};

use sitegen_core::{
    DomainError, FileBundle, NewRequest, Request, RequestId, RequestStatus, WebsiteId,
};

use crate::error::PipelineError;
use crate::requests::RequestStore;

/// Per-website async mutexes, created on first use.
#[derive(Debug, Default)]
pub struct SiteLocks {
    locks: Mutex<HashMap<WebsiteId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SiteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, website_id: WebsiteId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(website_id).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

/// Run `op`, and run it once more if it lost an optimistic write race.
pub(crate) async fn with_conflict_retry<T, F, Fut>(
    operation: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    match op().await {
        Err(err) if err.is_conflict() => {
            debug!(operation, error = %err, "write conflict, retrying once");
            op().await
        }
        other => other,
    }
}

/// Operations over all versions of a website.
#[derive(Clone)]
pub struct VersionChain {
    store: Arc<dyn RequestStore>,
    locks: Arc<SiteLocks>,
}

impl VersionChain {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self {
            store,
            locks: Arc::new(SiteLocks::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Take the website's lock. Not reentrant: the chain's own operations
    /// acquire it, so never call them while holding the guard.
    pub async fn lock(&self, website_id: WebsiteId) -> OwnedMutexGuard<()> {
        self.locks.lock(website_id).await
    }

    pub async fn get(&self, request_id: RequestId) -> Result<Request, PipelineError> {
        self.store
            .get(request_id)
            .await?
            .ok_or(PipelineError::NotFound(request_id))
    }

    /// Highest version of the website plus one, or 1 for a new website.
    pub async fn next_version(&self, website_id: WebsiteId) -> Result<u32, PipelineError> {
        Ok(self
            .store
            .max_version(website_id)
            .await?
            .map_or(1, |max| max + 1))
    }

    /// Insert `build(next_version)`; the caller holds the website lock.
    /// A version collision recomputes the version once.
    pub(crate) async fn append_locked<F>(
        &self,
        website_id: WebsiteId,
        build: F,
    ) -> Result<Request, PipelineError>
    where
        F: Fn(u32) -> NewRequest,
    {
        let build = &build;
        with_conflict_retry("append", move || async move {
            let version = self.next_version(website_id).await?;
            let new = build(version);
            new.validate()?;
            Ok::<_, PipelineError>(self.store.insert(new).await?)
        })
        .await
    }

    /// Insert the first version of a brand-new website.
    #[instrument(skip(self, new), fields(website_id = %new.website_id), err)]
    pub async fn create(&self, new: NewRequest) -> Result<Request, PipelineError> {
        new.validate()?;
        let website_id = new.website_id;
        let _guard = self.lock(website_id).await;
        let request = self
            .append_locked(website_id, |version| NewRequest {
                version,
                ..new.clone()
            })
            .await?;
        info!(request_id = %request.id, version = request.version, "website created");
        Ok(request)
    }

    /// Append an edit of `parent_id` as the next version and link it in.
    #[instrument(skip(self, instruction), err)]
    pub async fn append_edit(
        &self,
        parent_id: RequestId,
        instruction: &str,
    ) -> Result<Request, PipelineError> {
        let parent = self.get(parent_id).await?;
        let _guard = self.lock(parent.website_id).await;

        let parent = self.get(parent_id).await?;
        let child = self
            .append_locked(parent.website_id, |version| {
                NewRequest::modification(&parent, instruction, version)
            })
            .await?;
        let child = self.link_edit_locked(parent.id, child.id).await?;
        info!(
            request_id = %child.id,
            website_id = %child.website_id,
            version = child.version,
            parent = %parent.id,
            "modification appended"
        );
        Ok(child)
    }

    /// Make `child` the only edit of `parent`: `child.original_request` is set
    /// to the parent and every other request editing the parent is re-pointed
    /// to `child`, collapsing branches into a single lineage.
    #[instrument(skip(self), err)]
    pub async fn link_edit(
        &self,
        parent_id: RequestId,
        child_id: RequestId,
    ) -> Result<Request, PipelineError> {
        let child = self.get(child_id).await?;
        let _guard = self.lock(child.website_id).await;
        with_conflict_retry("link_edit", move || self.link_edit_locked(parent_id, child_id)).await
    }

    async fn link_edit_locked(
        &self,
        parent_id: RequestId,
        child_id: RequestId,
    ) -> Result<Request, PipelineError> {
        let mut child = self.get(child_id).await?;
        let parent = self.get(parent_id).await?;
        if parent.website_id != child.website_id {
            return Err(DomainError::invariant(format!(
                "request {child_id} and {parent_id} belong to different websites"
            ))
            .into());
        }

        let group = self.store.list_by_website(child.website_id).await?;
        let mut batch = Vec::new();
        for sibling in &group {
            if sibling.id == child_id || sibling.original_request != Some(parent_id) {
                continue;
            }
            let mut sibling = sibling.clone();
            sibling.relink(child_id)?;
            debug!(request_id = %sibling.id, to = %child_id, "re-pointing sibling edit");
            batch.push(sibling);
        }
        child.relink(parent_id)?;
        batch.push(child);

        let mut parents = lineage_map(&group);
        parents.extend(batch.iter().map(|r| (r.id, r.original_request)));
        if unterminated_lineage(&parents).is_some() {
            return Err(DomainError::invariant(format!(
                "linking request {child_id} under {parent_id} would create a lineage cycle"
            ))
            .into());
        }

        let mut saved = self.store.save_all(&batch).await?;
        saved
            .pop()
            .ok_or_else(|| PipelineError::Store("empty save result".to_string()))
    }

    /// `completed -> archived` for `request_id`; rejects `error` and `pending` records.
    #[instrument(skip(self), err)]
    pub async fn archive_previous(&self, request_id: RequestId) -> Result<Request, PipelineError> {
        let website_id = self.get(request_id).await?.website_id;
        let _guard = self.lock(website_id).await;
        with_conflict_retry("archive", move || async move {
            let mut request = self.get(request_id).await?;
            request.archive()?;
            Ok::<_, PipelineError>(self.store.save(&request).await?)
        })
        .await
    }

    /// Complete a pending request and archive every other completed version of
    /// its website in one atomic write.
    ///
    /// Returns `None` when the request is no longer pending (another delivery
    /// of the same job got there first).
    #[instrument(skip(self, files), fields(files = files.len()), err)]
    pub async fn promote(
        &self,
        request_id: RequestId,
        files: FileBundle,
    ) -> Result<Option<Request>, PipelineError> {
        let website_id = self.get(request_id).await?.website_id;
        let _guard = self.lock(website_id).await;
        let files = &files;
        with_conflict_retry("promote", move || async move {
            let mut request = self.get(request_id).await?;
            if !request.is_pending() {
                debug!(status = %request.status, "request no longer pending, not promoting");
                return Ok(None);
            }

            let mut batch = self.archive_other_heads(website_id, request_id).await?;
            request.complete(files.clone())?;
            batch.push(request);

            let mut saved = self.store.save_all(&batch).await?;
            Ok::<_, PipelineError>(saved.pop())
        })
        .await
    }

    /// `pending -> error`. Returns `None` when the request is no longer pending.
    #[instrument(skip(self, message), err)]
    pub async fn fail(
        &self,
        request_id: RequestId,
        message: &str,
    ) -> Result<Option<Request>, PipelineError> {
        let website_id = self.get(request_id).await?.website_id;
        let _guard = self.lock(website_id).await;
        self.fail_locked(request_id, message).await
    }

    /// [`VersionChain::fail`] for a caller already holding the website lock.
    pub(crate) async fn fail_locked(
        &self,
        request_id: RequestId,
        message: &str,
    ) -> Result<Option<Request>, PipelineError> {
        with_conflict_retry("fail", move || async move {
            let mut request = self.get(request_id).await?;
            if !request.is_pending() {
                debug!(status = %request.status, "request no longer pending, not failing");
                return Ok(None);
            }
            request.fail(message)?;
            Ok::<_, PipelineError>(Some(self.store.save(&request).await?))
        })
        .await
    }

    /// Make an archived version the live head again, archiving the current one.
    #[instrument(skip(self), err)]
    pub async fn restore_version(&self, request_id: RequestId) -> Result<Request, PipelineError> {
        let website_id = self.get(request_id).await?.website_id;
        let _guard = self.lock(website_id).await;
        with_conflict_retry("restore_version", move || async move {
            let mut request = self.get(request_id).await?;
            if request.status == RequestStatus::Completed {
                return Ok(request);
            }
            request.reinstate()?;

            let mut batch = self.archive_other_heads(website_id, request_id).await?;
            batch.push(request);
            let mut saved = self.store.save_all(&batch).await?;
            let restored = saved
                .pop()
                .ok_or_else(|| PipelineError::Store("empty save result".to_string()))?;
            info!(version = restored.version, "version restored as live head");
            Ok::<_, PipelineError>(restored)
        })
        .await
    }

    /// Verify that following `original_request` from every version terminates
    /// within as many hops as the website has versions.
    pub async fn check_lineage(&self, website_id: WebsiteId) -> Result<(), PipelineError> {
        let group = self.store.list_by_website(website_id).await?;
        match unterminated_lineage(&lineage_map(&group)) {
            Some(id) => Err(DomainError::invariant(format!(
                "lineage of request {id} does not terminate"
            ))
            .into()),
            None => Ok(()),
        }
    }

    async fn archive_other_heads(
        &self,
        website_id: WebsiteId,
        keep: RequestId,
    ) -> Result<Vec<Request>, PipelineError> {
        let mut batch = Vec::new();
        for mut head in self.store.list_by_website(website_id).await? {
            if head.id == keep || head.status != RequestStatus::Completed {
                continue;
            }
            head.archive()?;
            debug!(request_id = %head.id, version = head.version, "archiving previous head");
            batch.push(head);
        }
        Ok(batch)
    }
}

fn lineage_map(group: &[Request]) -> HashMap<RequestId, Option<RequestId>> {
    group.iter().map(|r| (r.id, r.original_request)).collect()
}

/// First request whose `original_request` walk takes more hops than there are
/// requests, i.e. runs into a cycle.
fn unterminated_lineage(parents: &HashMap<RequestId, Option<RequestId>>) -> Option<RequestId> {
    parents.iter().find_map(|(&start, &first)| {
        let mut cursor = first;
        let mut hops = 0usize;
        while let Some(id) = cursor {
            hops += 1;
            if hops > parents.len() {
                return Some(start);
            }
            cursor = parents.get(&id).copied().flatten();
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use sitegen_core::AccountId;

    use super::*;
    use crate::requests::InMemoryRequestStore;

    fn chain() -> VersionChain {
        VersionChain::new(Arc::new(InMemoryRequestStore::new()))
    }

    fn files(body: &str) -> FileBundle {
        FileBundle::new().with_file("index.html", body)
    }

    #[tokio::test]
    async fn versions_increase_from_one() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(chain.next_version(v1.website_id).await.unwrap(), 2);
        assert_eq!(chain.next_version(WebsiteId::new()).await.unwrap(), 1);

        let v2 = chain.append_edit(v1.id, "add a contact page").await.unwrap();
        let v3 = chain.append_edit(v2.id, "dark theme").await.unwrap();
        assert_eq!((v2.version, v3.version), (2, 3));
        assert_eq!(v2.original_request, Some(v1.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_edits_get_distinct_versions() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();

        let parent = v1.id;
        let mut tasks = Vec::new();
        for i in 0..8 {
            let chain = chain.clone();
            tasks.push(tokio::spawn(async move {
                chain.append_edit(parent, &format!("edit {i}")).await
            }));
        }
        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap().unwrap().version);
        }
        versions.sort_unstable();
        assert_eq!(versions, (2..=9).collect::<Vec<_>>());
        chain.check_lineage(v1.website_id).await.unwrap();
    }

    #[tokio::test]
    async fn link_edit_collapses_branches() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        let store = chain.store().clone();

        // Two edits of v1 inserted without linking.
        let a = store
            .insert(NewRequest::modification(&v1, "a", 2))
            .await
            .unwrap();
        let b = store
            .insert(NewRequest::modification(&v1, "b", 3))
            .await
            .unwrap();

        let b = chain.link_edit(v1.id, b.id).await.unwrap();
        let a = chain.get(a.id).await.unwrap();
        assert_eq!(b.original_request, Some(v1.id));
        assert_eq!(a.original_request, Some(b.id));
    }

    #[tokio::test]
    async fn link_edit_rejects_linking_under_a_descendant() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        let v2 = chain.append_edit(v1.id, "add a shop").await.unwrap();
        let v3 = chain.append_edit(v2.id, "dark theme").await.unwrap();

        for descendant in [v2.id, v3.id] {
            let err = chain.link_edit(descendant, v1.id).await.unwrap_err();
            assert!(matches!(err, PipelineError::Domain(DomainError::InvariantViolation(_))));
        }

        assert_eq!(chain.get(v1.id).await.unwrap().original_request, None);
        chain.check_lineage(v1.website_id).await.unwrap();
    }

    #[tokio::test]
    async fn promote_keeps_a_single_live_head() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        chain.promote(v1.id, files("v1")).await.unwrap().unwrap();

        let v2 = chain.append_edit(v1.id, "add a contact page").await.unwrap();
        // The parent stays live until the edit completes.
        assert_eq!(chain.get(v1.id).await.unwrap().status, RequestStatus::Completed);

        let v2 = chain.promote(v2.id, files("v2")).await.unwrap().unwrap();
        assert_eq!(v2.status, RequestStatus::Completed);
        assert_eq!(chain.get(v1.id).await.unwrap().status, RequestStatus::Archived);

        // A second promotion of the same request is a no-op.
        assert!(chain.promote(v2.id, files("again")).await.unwrap().is_none());
        assert_eq!(chain.get(v2.id).await.unwrap().generated_files, Some(files("v2")));
    }

    #[tokio::test]
    async fn restore_version_swaps_the_live_head() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        chain.promote(v1.id, files("v1")).await.unwrap();
        let v2 = chain.append_edit(v1.id, "add a contact page").await.unwrap();
        chain.promote(v2.id, files("v2")).await.unwrap();

        let restored = chain.restore_version(v1.id).await.unwrap();
        assert_eq!(restored.status, RequestStatus::Completed);
        assert_eq!(chain.get(v2.id).await.unwrap().status, RequestStatus::Archived);

        // Restoring the live head again changes nothing.
        assert_eq!(chain.restore_version(v1.id).await.unwrap().revision, restored.revision);
    }

    #[tokio::test]
    async fn archive_previous_rejects_failed_requests() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        chain.fail(v1.id, "boom").await.unwrap().unwrap();

        let err = chain.archive_previous(v1.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Domain(DomainError::InvariantViolation(_))));
        assert!(chain.fail(v1.id, "again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn check_lineage_detects_cycles() {
        let chain = chain();
        let v1 = chain
            .create(NewRequest::fresh(AccountId::new(), "make a blog"))
            .await
            .unwrap();
        let v2 = chain.append_edit(v1.id, "edit").await.unwrap();
        chain.check_lineage(v1.website_id).await.unwrap();

        // Force v1 -> v2 -> v1.
        let mut v1 = chain.get(v1.id).await.unwrap();
        v1.relink(v2.id).unwrap();
        chain.store().save(&v1).await.unwrap();

        let err = chain.check_lineage(v1.website_id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Domain(DomainError::InvariantViolation(_))));
    }
}
