use std::collections::BTreeSet;

use crate::{Phase, ResourceKey, Version};

/// Errors surfaced by the resource store and everything layered on it.
///
/// `NotFound`, `AlreadyExists` and `VersionConflict` are expected conditions a
/// caller can recover from (re-read, retry); they are never logged as faults.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StateError {
    #[error("resource {0} doesn't exist")]
    NotFound(ResourceKey),
    #[error("resource {0} already exists")]
    AlreadyExists(ResourceKey),
    #[error("resource {key} version conflict: expected {expected}, found {actual}")]
    VersionConflict { key: ResourceKey, expected: Version, actual: Version },
    #[error("resource {key} is in phase {actual}, expected {expected}")]
    PhaseConflict { key: ResourceKey, expected: Phase, actual: Phase },
    #[error("resource {key} has pending finalizers {finalizers:?}")]
    PendingFinalizers { key: ResourceKey, finalizers: BTreeSet<String> },
    #[error("validation rule {rule:?} failed: {reason}")]
    ValidationFailed { rule: String, reason: String },
    #[error("invalid query {selector:?}: {reason}")]
    InvalidQuery { selector: String, reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StateResult<T> = Result<T, StateError>;

impl StateError {
    pub fn is_not_found(&self) -> bool { matches!(self, StateError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. } | StateError::PhaseConflict { .. } | StateError::AlreadyExists(_))
    }
    pub fn is_cancelled(&self) -> bool { matches!(self, StateError::Cancelled) }

    pub fn invalid_query(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::InvalidQuery { selector: selector.into(), reason: reason.into() }
    }

    pub fn validation(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::ValidationFailed { rule: rule.into(), reason: reason.into() }
    }
}
