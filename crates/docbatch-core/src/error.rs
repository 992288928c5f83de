//! Error types for batch document operations
//!
//! Provides the error taxonomy for:
//! - Submission-time rejections (validation, missing targets, permission, preflight budget)
//! - Execution-time item failures (conflicts, locks, timeouts, repository errors)
//! - Control-plane misuse (cancel/undo on the wrong state)
//! - Collaborator failures (repository, lock service, event bus)

use serde::{Deserialize, Serialize};

use crate::batch::BatchStatus;
use crate::types::{BatchId, NodeId, UserId, Version};

/// Serializable error classification carried by item results and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    TargetNotFound,
    PermissionDenied,
    PreflightTimeout,
    VersionConflict,
    LockConflict,
    ExecutionTimeout,
    TransientRepositoryError,
    InvalidState,
    UndoFailed,
    Cancelled,
    NotFound,
    RepositoryError,
    StoreError,
}

impl ErrorCode {
    /// Whether this code describes a version or lock conflict
    #[inline]
    #[must_use]
    pub fn is_conflict(self) -> bool {
        matches!(self, Self::VersionConflict | Self::LockConflict)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::PreflightTimeout => "PREFLIGHT_TIMEOUT",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::LockConflict => "LOCK_CONFLICT",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::TransientRepositoryError => "TRANSIENT_REPOSITORY_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::UndoFailed => "UNDO_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::NotFound => "NOT_FOUND",
            Self::RepositoryError => "REPOSITORY_ERROR",
            Self::StoreError => "STORE_ERROR",
        };
        f.write_str(text)
    }
}

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Bad request shape or forbidden option combination
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested target does not exist in the project
    #[error("target not found: {0}")]
    TargetNotFound(NodeId),

    /// Caller may not mutate the project or node
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Preflight exceeded its time budget
    #[error("preflight timed out after {budget_ms}ms")]
    PreflightTimeout { budget_ms: u64 },

    /// Live version differs from the caller's expectation
    #[error("version conflict on {target}: expected {expected}, found {actual}")]
    VersionConflict {
        target: NodeId,
        expected: Version,
        actual: Version,
    },

    /// Node is locked by another editor
    #[error("{target} is locked by {owner}")]
    LockConflict { target: NodeId, owner: UserId },

    /// Executor exceeded its time budget
    #[error("execution timed out after {budget_ms}ms")]
    ExecutionTimeout { budget_ms: u64 },

    /// Repository failed transiently and retries were exhausted
    #[error("transient repository error: {0}")]
    TransientRepository(String),

    /// Operation not allowed in the batch's current status
    #[error("cannot {action} batch {batch_id} in status {status:?}")]
    InvalidState {
        batch_id: BatchId,
        status: BatchStatus,
        action: &'static str,
    },

    /// Some compensating actions could not be applied
    #[error("undo of batch {batch_id} left {failed} item(s) unreverted")]
    UndoFailed { batch_id: BatchId, failed: usize },

    /// Unknown batch
    #[error("batch not found: {0}")]
    NotFound(BatchId),

    /// Non-transient repository failure
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Lock service failure
    #[error("lock service error: {0}")]
    LockService(#[from] LockServiceError),

    /// Batch store rejected a write
    #[error("store error: {0}")]
    Store(String),

    /// Illegal status change
    #[error("state machine error: {0}")]
    Transition(#[from] TransitionError),

    /// Item result would break a record invariant
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

impl BatchError {
    /// Classification for item results and events
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::TargetNotFound(_) => ErrorCode::TargetNotFound,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::PreflightTimeout { .. } => ErrorCode::PreflightTimeout,
            Self::VersionConflict { .. } => ErrorCode::VersionConflict,
            Self::LockConflict { .. } => ErrorCode::LockConflict,
            Self::ExecutionTimeout { .. } => ErrorCode::ExecutionTimeout,
            Self::TransientRepository(_) => ErrorCode::TransientRepositoryError,
            Self::InvalidState { .. } | Self::Transition(_) => ErrorCode::InvalidState,
            Self::UndoFailed { .. } => ErrorCode::UndoFailed,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Repository(RepositoryError::NotFound(_)) => ErrorCode::TargetNotFound,
            Self::Repository(RepositoryError::Transient(_)) => ErrorCode::TransientRepositoryError,
            Self::Repository(_) | Self::LockService(_) => ErrorCode::RepositoryError,
            Self::Store(_) | Self::Record(_) => ErrorCode::StoreError,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientRepository(_) | Self::Repository(RepositoryError::Transient(_))
        )
    }

    /// Whether the error rejects a submission before any record exists
    #[inline]
    #[must_use]
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::TargetNotFound(_) | Self::PermissionDenied(_) | Self::PreflightTimeout { .. }
        )
    }
}

/// Document repository failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// Temporary failure; the call may succeed if retried
    #[error("transient failure: {0}")]
    Transient(String),

    /// Node does not exist
    #[error("node not found: {0}")]
    NotFound(NodeId),

    /// The mutation is structurally impossible (e.g. node has children)
    #[error("rejected: {0}")]
    Rejected(String),

    /// Any other permanent failure
    #[error("{0}")]
    Other(String),
}

impl RepositoryError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Lock service failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockServiceError {
    /// Lock service could not be reached
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

/// Event bus failures (logged, never surfaced)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    /// Publication failed
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Illegal batch status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: BatchStatus,
    pub to: BatchStatus,
}

/// Violations of the item-result invariants
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Target is not part of the expanded set
    #[error("{0} is not a target of this batch")]
    UnknownTarget(NodeId),

    /// Target already has a recorded outcome
    #[error("{0} already has an outcome")]
    DuplicateResult(NodeId),

    /// Record no longer accepts this kind of write
    #[error("batch in status {0:?} does not accept {1}")]
    Frozen(BatchStatus, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_error_display() {
        let err = BatchError::Validation("empty targets".to_string());
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(BatchError::TargetNotFound(NodeId::new("x")).code(), ErrorCode::TargetNotFound);
        assert_eq!(
            BatchError::Repository(RepositoryError::Transient("io".into())).code(),
            ErrorCode::TransientRepositoryError
        );
        assert_eq!(
            BatchError::from(TransitionError {
                from: BatchStatus::Undone,
                to: BatchStatus::Executing,
            })
            .code(),
            ErrorCode::InvalidState
        );
    }

    #[test]
    fn retryable_only_for_transient() {
        assert!(BatchError::TransientRepository("timeout".into()).is_retryable());
        assert!(BatchError::Repository(RepositoryError::Transient("x".into())).is_retryable());
        assert!(!BatchError::Repository(RepositoryError::Other("x".into())).is_retryable());
        assert!(!BatchError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn submission_errors_are_classified() {
        assert!(BatchError::PreflightTimeout { budget_ms: 10 }.is_submission_error());
        assert!(!BatchError::ExecutionTimeout { budget_ms: 10 }.is_submission_error());
    }

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::VersionConflict).unwrap();
        assert_eq!(json, "\"VERSION_CONFLICT\"");
        assert_eq!(ErrorCode::LockConflict.to_string(), "LOCK_CONFLICT");
    }
}
