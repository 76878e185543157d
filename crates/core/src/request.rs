//! Versioned generation requests and their status state machine.
//!
//! A [`Request`] is one generation attempt for one logical website. All
//! versions of a website share a [`WebsiteId`]; `original_request` links a
//! version to the one it edits.
//!
//! ```text
//! pending   --(generation success)-->  completed
//! pending   --(terminal failure)-->    error
//! completed --(superseded)-->          archived
//! archived  --(explicit restore)-->    completed
//! ```
//!
//! `error` is final for the record itself: recovery always creates a new
//! request.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::files::FileBundle;
use crate::id::{AccountId, RequestId, WebsiteId};

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting for (or undergoing) generation
    Pending,
    /// Generated successfully; the live head of its website
    Completed,
    /// Generation failed terminally
    Error,
    /// Superseded by a newer completed version
    Archived,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
            RequestStatus::Error => "error",
            RequestStatus::Archived => "archived",
        }
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "completed" => Ok(RequestStatus::Completed),
            "error" => Ok(RequestStatus::Error),
            "archived" => Ok(RequestStatus::Archived),
            other => Err(DomainError::validation(format!("unknown request status: {other}"))),
        }
    }
}

/// A request that has not been persisted yet (no id, no revision).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequest {
    pub website_id: WebsiteId,
    pub account_id: AccountId,
    pub version: u32,
    pub content: String,
    pub modification_request: Option<String>,
    pub original_request: Option<RequestId>,
    /// Seed files (only set for restoration requests).
    pub generated_files: Option<FileBundle>,
    pub website_type: Option<String>,
    pub features: Vec<String>,
    pub restoration_of: Option<RequestId>,
}

impl NewRequest {
    /// First version of a brand-new website.
    pub fn fresh(account_id: AccountId, content: impl Into<String>) -> Self {
        Self {
            website_id: WebsiteId::new(),
            account_id,
            version: 1,
            content: content.into(),
            modification_request: None,
            original_request: None,
            generated_files: None,
            website_type: None,
            features: Vec::new(),
            restoration_of: None,
        }
    }

    /// An edit of `parent`. The caller links it into the lineage.
    pub fn modification(parent: &Request, instruction: impl Into<String>, version: u32) -> Self {
        Self {
            website_id: parent.website_id,
            account_id: parent.account_id,
            version,
            content: parent.content.clone(),
            modification_request: Some(instruction.into()),
            original_request: Some(parent.id),
            generated_files: None,
            website_type: parent.website_type.clone(),
            features: parent.features.clone(),
            restoration_of: None,
        }
    }

    /// A fresh attempt seeded from a known-good `ancestor`, replacing `failed`.
    pub fn restoration(ancestor: &Request, failed: &Request, version: u32) -> Self {
        Self {
            website_id: ancestor.website_id,
            account_id: ancestor.account_id,
            version,
            content: ancestor.content.clone(),
            modification_request: None,
            original_request: Some(ancestor.original_request.unwrap_or(ancestor.id)),
            generated_files: ancestor.generated_files.clone(),
            website_type: ancestor.website_type.clone(),
            features: ancestor.features.clone(),
            restoration_of: Some(failed.id),
        }
    }

    pub fn with_website_type(mut self, website_type: impl Into<String>) -> Self {
        self.website_type = Some(website_type.into());
        self
    }

    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.content.trim().is_empty() {
            return Err(DomainError::validation("content must not be empty"));
        }
        if self.version == 0 {
            return Err(DomainError::validation("version starts at 1"));
        }
        if matches!(&self.modification_request, Some(m) if m.trim().is_empty()) {
            return Err(DomainError::validation("modification request must not be empty"));
        }
        Ok(())
    }
}

/// One generation attempt for one version of a website.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub website_id: WebsiteId,
    pub account_id: AccountId,
    pub version: u32,
    pub status: RequestStatus,
    pub content: String,
    pub modification_request: Option<String>,
    pub original_request: Option<RequestId>,
    pub generated_files: Option<FileBundle>,
    pub error: Option<String>,
    pub website_type: Option<String>,
    pub features: Vec<String>,
    pub deployed: bool,
    pub domain_name: Option<String>,
    /// Set on a rollback-spawned request: the failed request it replaces.
    pub restoration_of: Option<RequestId>,
    /// Set on a failed request once a restoration request was spawned for it.
    pub restored_by: Option<RequestId>,
    /// Row revision for compare-and-swap writes; owned by the store.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Materialize a persisted request from its insert payload.
    pub fn from_new(id: RequestId, new: NewRequest, revision: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            website_id: new.website_id,
            account_id: new.account_id,
            version: new.version,
            status: RequestStatus::Pending,
            content: new.content,
            modification_request: new.modification_request,
            original_request: new.original_request,
            generated_files: new.generated_files,
            error: None,
            website_type: new.website_type,
            features: new.features,
            deployed: false,
            domain_name: None,
            restoration_of: new.restoration_of,
            restored_by: None,
            revision,
            created_at: now,
            updated_at: now,
        }
    }

    /// The text sent to the generation backend.
    pub fn prompt_text(&self) -> &str {
        self.modification_request.as_deref().unwrap_or(&self.content)
    }

    pub fn is_modification(&self) -> bool {
        self.modification_request.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// `pending -> completed`. Files and status change together.
    pub fn complete(&mut self, files: FileBundle) -> DomainResult<()> {
        self.expect_status(RequestStatus::Pending, "complete")?;
        if files.is_empty() {
            return Err(DomainError::invariant(format!(
                "request {} cannot complete without generated files",
                self.id
            )));
        }
        self.generated_files = Some(files);
        self.error = None;
        self.status = RequestStatus::Completed;
        self.touch();
        Ok(())
    }

    /// `pending -> error`.
    pub fn fail(&mut self, message: impl Into<String>) -> DomainResult<()> {
        self.expect_status(RequestStatus::Pending, "fail")?;
        self.error = Some(message.into());
        self.status = RequestStatus::Error;
        self.touch();
        Ok(())
    }

    /// `completed -> archived` (no-op when already archived).
    pub fn archive(&mut self) -> DomainResult<()> {
        match self.status {
            RequestStatus::Archived => Ok(()),
            RequestStatus::Completed => {
                self.status = RequestStatus::Archived;
                self.touch();
                Ok(())
            }
            other => Err(DomainError::invariant(format!(
                "request {} cannot be archived from status {other}",
                self.id
            ))),
        }
    }

    /// `archived -> completed` (no-op when already completed).
    pub fn reinstate(&mut self) -> DomainResult<()> {
        match self.status {
            RequestStatus::Completed => Ok(()),
            RequestStatus::Archived => {
                if self.generated_files.as_ref().is_none_or(FileBundle::is_empty) {
                    return Err(DomainError::invariant(format!(
                        "request {} has no files to restore",
                        self.id
                    )));
                }
                self.status = RequestStatus::Completed;
                self.touch();
                Ok(())
            }
            other => Err(DomainError::invariant(format!(
                "request {} cannot be restored from status {other}",
                self.id
            ))),
        }
    }

    /// Point this request at a new parent in the lineage.
    pub fn relink(&mut self, parent: RequestId) -> DomainResult<()> {
        if parent == self.id {
            return Err(DomainError::invariant(format!(
                "request {} cannot be its own parent",
                self.id
            )));
        }
        self.original_request = Some(parent);
        self.touch();
        Ok(())
    }

    /// Record the restoration spawned for this failed request.
    pub fn mark_restored_by(&mut self, restoration: RequestId) -> DomainResult<()> {
        self.expect_status(RequestStatus::Error, "mark restored")?;
        self.restored_by = Some(restoration);
        self.touch();
        Ok(())
    }

    fn expect_status(&self, expected: RequestStatus, action: &str) -> DomainResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "cannot {action} request {} in status {} (expected {expected})",
                self.id, self.status
            )))
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: i64) -> Request {
        Request::from_new(
            RequestId::new(id),
            NewRequest::fresh(AccountId::new(), "make a blog"),
            1,
            Utc::now(),
        )
    }

    fn files() -> FileBundle {
        FileBundle::new().with_file("index.html", "<h1>blog</h1>")
    }

    #[test]
    fn completes_only_with_files() {
        let mut request = pending(1);

        assert!(matches!(
            request.complete(FileBundle::new()),
            Err(DomainError::InvariantViolation(_))
        ));
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.generated_files.is_none());

        request.complete(files()).unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(request.generated_files, Some(files()));
    }

    #[test]
    fn error_is_final_for_the_record() {
        let mut request = pending(1);
        request.fail("backend unavailable").unwrap();

        assert_eq!(request.error.as_deref(), Some("backend unavailable"));
        assert!(request.complete(files()).is_err());
        assert!(request.archive().is_err());
        assert!(request.reinstate().is_err());
    }

    #[test]
    fn archive_and_reinstate_round_trip() {
        let mut request = pending(1);
        request.complete(files()).unwrap();

        request.archive().unwrap();
        assert_eq!(request.status, RequestStatus::Archived);
        request.archive().unwrap();

        request.reinstate().unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
    }

    #[test]
    fn pending_cannot_be_archived() {
        let mut request = pending(1);
        assert!(request.archive().is_err());
    }

    #[test]
    fn prompt_prefers_the_modification_instruction() {
        let mut parent = pending(1);
        parent.complete(files()).unwrap();
        let edit = Request::from_new(
            RequestId::new(2),
            NewRequest::modification(&parent, "add a contact page", 2),
            1,
            Utc::now(),
        );

        assert_eq!(parent.prompt_text(), "make a blog");
        assert_eq!(edit.prompt_text(), "add a contact page");
        assert_eq!(edit.original_request, Some(parent.id));
        assert_eq!(edit.website_id, parent.website_id);
    }

    #[test]
    fn restoration_copies_the_ancestor_baseline() {
        let mut ancestor = pending(1);
        ancestor.website_type = Some("blog".to_string());
        ancestor.complete(files()).unwrap();
        let mut failed = Request::from_new(
            RequestId::new(2),
            NewRequest::modification(&ancestor, "break it", 2),
            1,
            Utc::now(),
        );
        failed.fail("boom").unwrap();

        let seed = NewRequest::restoration(&ancestor, &failed, 3);

        assert_eq!(seed.generated_files, Some(files()));
        assert_eq!(seed.original_request, Some(ancestor.id));
        assert_eq!(seed.restoration_of, Some(failed.id));
        assert_eq!(seed.website_type.as_deref(), Some("blog"));
        assert!(seed.modification_request.is_none());
    }

    #[test]
    fn validation_rejects_blank_prompts() {
        let blank = NewRequest::fresh(AccountId::new(), "   ");
        assert!(matches!(blank.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn status_parses_its_own_wire_name() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Completed,
            RequestStatus::Error,
            RequestStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
    }
}
