//! Target expansion and destination checks
//!
//! Expansion walks each requested folder in pre-order so a parent always
//! precedes its descendants, and keeps the first occurrence of every ID.

use indexmap::IndexSet;

use docbatch_core::{BatchError, DocumentNode, NodeId, Placement, ProjectId, TargetList};

use crate::collaborators::DocumentRepository;

/// Resolves requested IDs into the frozen expanded target set
pub struct TargetExpander<'a> {
    repository: &'a dyn DocumentRepository,
    project_id: &'a ProjectId,
    max_expanded: usize,
}

impl<'a> TargetExpander<'a> {
    /// Expander scoped to one project
    #[must_use]
    pub fn new(repository: &'a dyn DocumentRepository, project_id: &'a ProjectId, max_expanded: usize) -> Self {
        Self {
            repository,
            project_id,
            max_expanded,
        }
    }

    /// Expand `requested`, optionally with descendants
    ///
    /// # Errors
    /// `TargetNotFound` if a requested ID is absent or belongs to another
    /// project; `Validation` if the result exceeds the expansion limit.
    pub async fn expand(&self, requested: &TargetList, include_descendants: bool) -> Result<TargetList, BatchError> {
        let mut expanded: IndexSet<NodeId> = IndexSet::with_capacity(requested.len());

        for id in requested {
            let node = self.require(id).await?;
            expanded.insert(id.clone());
            if include_descendants && node.kind.is_container() {
                self.collect_descendants(&node, &mut expanded).await?;
            }
            self.check_limit(expanded.len())?;
        }

        tracing::debug!(requested = requested.len(), expanded = expanded.len(), "targets expanded");
        Ok(TargetList::new(expanded))
    }

    async fn collect_descendants(&self, root: &DocumentNode, out: &mut IndexSet<NodeId>) -> Result<(), BatchError> {
        let mut stack = self.children_reversed(&root.id).await?;
        while let Some(child) = stack.pop() {
            // A child removed since listing is simply not expanded
            let Some(node) = self.repository.read(&child).await? else {
                continue;
            };
            if out.insert(child.clone()) {
                self.check_limit(out.len())?;
                if node.kind.is_container() {
                    stack.extend(self.children_reversed(&child).await?);
                }
            }
        }
        Ok(())
    }

    /// Children of `folder`, last first, so popping yields sibling order
    async fn children_reversed(&self, folder: &NodeId) -> Result<Vec<NodeId>, BatchError> {
        let mut children = self.repository.children(self.project_id, Some(folder)).await?;
        children.reverse();
        Ok(children)
    }

    async fn require(&self, id: &NodeId) -> Result<DocumentNode, BatchError> {
        match self.repository.read(id).await? {
            Some(node) if &node.project_id == self.project_id => Ok(node),
            _ => Err(BatchError::TargetNotFound(id.clone())),
        }
    }

    fn check_limit(&self, len: usize) -> Result<(), BatchError> {
        if len > self.max_expanded {
            return Err(BatchError::Validation(format!(
                "expansion exceeds {} targets",
                self.max_expanded
            )));
        }
        Ok(())
    }
}

/// Reject Move/Copy destinations that are missing, not folders, or inside
/// the requested subtrees
///
/// # Errors
/// `Validation` describing the first broken rule.
pub async fn check_destination(
    repository: &dyn DocumentRepository,
    project_id: &ProjectId,
    placement: &Placement,
    requested: &TargetList,
) -> Result<(), BatchError> {
    let Some(destination) = placement.destination() else {
        return Ok(());
    };

    let node = match repository.read(destination).await? {
        Some(node) if &node.project_id == project_id => node,
        _ => {
            return Err(BatchError::Validation(format!(
                "destination {destination} not found in project"
            )))
        }
    };
    if !node.kind.is_container() {
        return Err(BatchError::Validation(format!("destination {destination} is not a folder")));
    }

    let mut seen = IndexSet::new();
    let mut cursor = Some(node);
    while let Some(current) = cursor {
        if requested.contains(&current.id) {
            return Err(BatchError::Validation(format!(
                "destination {destination} lies inside target {}",
                current.id
            )));
        }
        if !seen.insert(current.id.clone()) {
            break;
        }
        cursor = match current.parent_id {
            Some(parent) => repository.read(&parent).await?,
            None => None,
        };
    }
    Ok(())
}
