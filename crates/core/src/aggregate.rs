//! Aggregate root trait and optimistic concurrency helpers.

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
///
/// Persistence adapters rely on `version()` as the optimistic concurrency token:
/// it is bumped once per persisted mutation, never by in-memory transitions.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Version of the aggregate as last loaded from (or written to) storage.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The aggregate must not exist yet.
    NoAggregate,
    /// Require the aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation derived from an in-memory aggregate: version 0 means it was
    /// never persisted.
    pub fn from_version(version: u64) -> Self {
        if version == 0 {
            ExpectedVersion::NoAggregate
        } else {
            ExpectedVersion::Exact(version)
        }
    }

    /// `actual` is `None` when the aggregate is absent from storage.
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedVersion::NoAggregate, None) => true,
            (ExpectedVersion::Exact(v), Some(a)) => v == a,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<u64>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_must_match() {
        assert!(ExpectedVersion::Exact(3).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(3).matches(Some(4)));
        assert!(!ExpectedVersion::Exact(3).matches(None));
    }

    #[test]
    fn no_aggregate_only_matches_absent() {
        assert!(ExpectedVersion::NoAggregate.matches(None));
        assert!(ExpectedVersion::NoAggregate.check(Some(1)).is_err());
    }

    #[test]
    fn from_version_treats_zero_as_new() {
        assert_eq!(ExpectedVersion::from_version(0), ExpectedVersion::NoAggregate);
        assert_eq!(ExpectedVersion::from_version(7), ExpectedVersion::Exact(7));
    }

    #[test]
    fn check_reports_conflict() {
        let err = ExpectedVersion::Exact(1).check(Some(2)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
