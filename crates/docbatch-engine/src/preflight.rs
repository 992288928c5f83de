//! Preflight validation
//!
//! Read-only pass over the expanded targets. Each target lands in exactly
//! one bucket with precedence missing > locked > conflicted > valid.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;

use docbatch_core::{
    BatchError, ErrorCode, NodeId, PreflightIssue, PreflightSummary, ProjectId, TargetList, UserId, Version,
};

use crate::collaborators::Collaborators;

/// Bucket assigned to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Missing { code: ErrorCode, message: String },
    Locked { owner: UserId },
    Conflicted { expected: Version, actual: Version },
}

/// Runs the four per-target checks with bounded concurrency
pub struct PreflightValidator<'a> {
    collaborators: &'a Collaborators,
    concurrency: usize,
}

impl<'a> PreflightValidator<'a> {
    #[must_use]
    pub fn new(collaborators: &'a Collaborators, concurrency: usize) -> Self {
        Self {
            collaborators,
            concurrency: concurrency.max(1),
        }
    }

    /// Tally every target into a summary, preserving target order in `issues`
    ///
    /// # Errors
    /// Collaborator failures (repository, lock service) abort the preflight.
    pub async fn run(
        &self,
        user: &UserId,
        project_id: &ProjectId,
        targets: &TargetList,
        expected: &HashMap<NodeId, Version>,
    ) -> Result<PreflightSummary, BatchError> {
        let verdicts: Vec<(NodeId, Verdict)> = stream::iter(targets.iter())
            .map(|id| async move {
                let verdict = self.check(user, project_id, id, expected.get(id).copied()).await?;
                Ok::<_, BatchError>((id.clone(), verdict))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let summary = summarize(verdicts);
        tracing::info!(
            total = summary.total,
            valid = summary.valid,
            conflicted = summary.conflicted,
            locked = summary.locked,
            missing = summary.missing,
            "preflight complete"
        );
        Ok(summary)
    }

    /// Classify one target
    ///
    /// # Errors
    /// Propagates repository and lock service failures.
    pub async fn check(
        &self,
        user: &UserId,
        project_id: &ProjectId,
        id: &NodeId,
        expected: Option<Version>,
    ) -> Result<Verdict, BatchError> {
        match self.collaborators.repository.read(id).await? {
            Some(node) if &node.project_id == project_id => {}
            _ => {
                return Ok(Verdict::Missing {
                    code: ErrorCode::TargetNotFound,
                    message: format!("{id} no longer exists"),
                })
            }
        };

        if !self.collaborators.permissions.can_mutate(user, id).await {
            return Ok(Verdict::Missing {
                code: ErrorCode::PermissionDenied,
                message: format!("{user} may not modify {id}"),
            });
        }

        if let Some(owner) = self.collaborators.foreign_lock(id, user).await? {
            return Ok(Verdict::Locked { owner });
        }

        let Some(expected) = expected else {
            return Ok(Verdict::Valid);
        };
        match self.collaborators.repository.version(id).await? {
            Some(actual) if actual != expected => Ok(Verdict::Conflicted { expected, actual }),
            Some(_) => Ok(Verdict::Valid),
            None => Ok(Verdict::Missing {
                code: ErrorCode::TargetNotFound,
                message: format!("{id} no longer exists"),
            }),
        }
    }
}

/// Fold verdicts into a summary
#[must_use]
pub fn summarize(verdicts: impl IntoIterator<Item = (NodeId, Verdict)>) -> PreflightSummary {
    let mut summary = PreflightSummary::default();
    for (target_id, verdict) in verdicts {
        summary.total += 1;
        let (code, message) = match verdict {
            Verdict::Valid => {
                summary.valid += 1;
                continue;
            }
            Verdict::Missing { code, message } => {
                summary.missing += 1;
                (code, message)
            }
            Verdict::Locked { owner } => {
                summary.locked += 1;
                (ErrorCode::LockConflict, format!("locked by {owner}"))
            }
            Verdict::Conflicted { expected, actual } => {
                summary.conflicted += 1;
                (ErrorCode::VersionConflict, format!("expected {expected}, found {actual}"))
            }
        };
        summary.issues.push(PreflightIssue {
            target_id,
            code,
            message,
        });
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_exclusive() {
        let summary = summarize(vec![
            (NodeId::new("a"), Verdict::Valid),
            (
                NodeId::new("b"),
                Verdict::Locked {
                    owner: UserId::new("bob"),
                },
            ),
            (
                NodeId::new("c"),
                Verdict::Conflicted {
                    expected: Version(1),
                    actual: Version(2),
                },
            ),
            (
                NodeId::new("d"),
                Verdict::Missing {
                    code: ErrorCode::PermissionDenied,
                    message: "denied".into(),
                },
            ),
        ]);

        assert_eq!(summary.total, 4);
        assert_eq!(
            (summary.valid, summary.locked, summary.conflicted, summary.missing),
            (1, 1, 1, 1)
        );
        let codes: Vec<_> = summary.issues.iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec![ErrorCode::LockConflict, ErrorCode::VersionConflict, ErrorCode::PermissionDenied]
        );
        assert!(!summary.is_clean());
    }
}
