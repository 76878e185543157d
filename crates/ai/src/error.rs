use std::time::Duration;

use thiserror::Error;

/// Whether a failed generation call is worth repeating.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure, timeout, rate limit, overloaded provider.
    Transient,
    /// Malformed request, authentication failure, empty or unusable result.
    Permanent,
}

/// Failure reported by a [`GenerationBackend`](crate::GenerationBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("rate limited by backend: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    #[error("backend returned no files")]
    EmptyResult,

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::RateLimited { .. }
            | BackendError::Timeout(_)
            | BackendError::Network(_)
            | BackendError::Unavailable(_) => ErrorClass::Transient,
            BackendError::InvalidRequest(_)
            | BackendError::Unauthorized(_)
            | BackendError::EmptyResult
            | BackendError::Malformed(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Minimum wait the backend asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_transient_from_permanent() {
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(
            BackendError::RateLimited {
                message: "slow down".into(),
                retry_after: None
            }
            .is_transient()
        );

        assert_eq!(BackendError::EmptyResult.class(), ErrorClass::Permanent);
        assert_eq!(
            BackendError::Unauthorized("bad key".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn only_rate_limits_carry_a_retry_hint() {
        let limited = BackendError::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(BackendError::Unavailable("503".into()).retry_after(), None);
    }
}
