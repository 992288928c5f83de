//! Execution-time conflict resolution
//!
//! Pure policy table. Version mismatches may be overwritten; editing locks
//! never are.

use docbatch_core::{ConflictPolicy, ErrorCode, UserId, Version};

/// Conflict observed on a live node right before its mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    Version { expected: Version, actual: Version },
    Lock { owner: UserId },
}

impl Conflict {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Version { .. } => ErrorCode::VersionConflict,
            Self::Lock { .. } => ErrorCode::LockConflict,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Version { expected, actual } => format!("version conflict: expected {expected}, found {actual}"),
            Self::Lock { owner } => format!("locked by {owner}"),
        }
    }
}

/// What the executor does with one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Apply the mutation; `overwritten` is the ignored expectation, if any
    Proceed { overwritten: Option<Version> },
    /// Record `Skipped` and continue
    Skip(Conflict),
    /// Record `Failed` and continue
    Reject(Conflict),
    /// Record `Failed` and stop the batch
    Abort(Conflict),
}

/// Apply `policy` to the conflict found on one item
#[must_use]
pub fn resolve(policy: ConflictPolicy, conflict: Option<Conflict>) -> Resolution {
    let Some(conflict) = conflict else {
        return Resolution::Proceed { overwritten: None };
    };
    match (policy, conflict) {
        (ConflictPolicy::FailFast, conflict) => Resolution::Abort(conflict),
        (ConflictPolicy::SkipConflicts, conflict) => Resolution::Skip(conflict),
        (ConflictPolicy::ForceOverwrite, Conflict::Version { expected, .. }) => Resolution::Proceed {
            overwritten: Some(expected),
        },
        (ConflictPolicy::ForceOverwrite, lock @ Conflict::Lock { .. }) => Resolution::Reject(lock),
    }
}
