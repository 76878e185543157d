//! Optimistic concurrency on request rows.

use crate::error::{DomainError, DomainResult};

/// Revision expectation for a conditional (compare-and-swap) write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Skip revision checking (fresh inserts, migrations).
    Any,
    /// Require the stored row to be at an exact revision.
    Exact(u64),
}

impl ExpectedRevision {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedRevision::Any => true,
            ExpectedRevision::Exact(r) => r == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_revision_rejects_stale_writers() {
        assert!(ExpectedRevision::Exact(3).check(3).is_ok());
        assert!(matches!(
            ExpectedRevision::Exact(3).check(4),
            Err(DomainError::Conflict(_))
        ));
        assert!(ExpectedRevision::Any.matches(99));
    }
}
