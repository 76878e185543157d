//! Pipeline-level errors.

use sitegen_ai::BackendError;
use sitegen_core::{DomainError, RequestId};

use crate::artifacts::ArtifactError;
use crate::jobs::{QueueError, RetryError};
use crate::requests::StoreError;

/// Error surfaced by the dispatcher, version chain, rollback and site service.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The referenced request (or website) does not exist.
    #[error("request not found: {0}")]
    NotFound(RequestId),
    /// Optimistic write conflict on a version or status; recompute and retry.
    #[error("concurrent modification: {0}")]
    Conflict(String),
    /// Deterministic domain failure (validation, illegal transition).
    #[error(transparent)]
    Domain(DomainError),
    #[error("request store error: {0}")]
    Store(String),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => PipelineError::NotFound(id),
            StoreError::Conflict(msg) => PipelineError::Conflict(msg),
            StoreError::Storage(msg) => PipelineError::Store(msg),
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => PipelineError::Conflict(msg),
            other => PipelineError::Domain(other),
        }
    }
}

impl PipelineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Conflict(_))
    }
}

/// A generation attempt that will not be retried any further.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generation failed after {attempts} attempt(s): {source}")]
pub struct TerminalGenerationError {
    pub attempts: u32,
    /// `true` when the retry budget ran out, `false` for a permanent error.
    pub exhausted: bool,
    pub source: BackendError,
}

impl From<RetryError<BackendError>> for TerminalGenerationError {
    fn from(value: RetryError<BackendError>) -> Self {
        let exhausted = matches!(value, RetryError::Exhausted { .. });
        let attempts = value.attempts();
        Self {
            attempts,
            exhausted,
            source: value.into_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_become_pipeline_conflicts() {
        let err: PipelineError = StoreError::Conflict("revision 3 != 4".into()).into();
        assert!(err.is_conflict());

        let err: PipelineError = DomainError::conflict("stale").into();
        assert!(err.is_conflict());

        let err: PipelineError = DomainError::invariant("bad transition").into();
        assert!(matches!(err, PipelineError::Domain(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn terminal_error_message_names_the_attempts() {
        let err = TerminalGenerationError::from(RetryError::Exhausted {
            error: BackendError::Network("reset".into()),
            attempts: 3,
        });
        assert!(err.exhausted);
        assert_eq!(
            err.to_string(),
            "generation failed after 3 attempt(s): network error: reset"
        );
    }
}
