use async_trait::async_trait;
use dashmap::DashSet;

use docbatch_core::{NodeId, ProjectId, UserId};

use crate::collaborators::PermissionChecker;

/// Allow-by-default permission table with explicit denials
#[derive(Debug, Default)]
pub struct MemoryPermissions {
    denied_projects: DashSet<(UserId, ProjectId)>,
    denied_nodes: DashSet<(UserId, NodeId)>,
}

impl MemoryPermissions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_project(&self, user: &UserId, project_id: &ProjectId) {
        self.denied_projects.insert((user.clone(), project_id.clone()));
    }

    pub fn deny_node(&self, user: &UserId, id: &NodeId) {
        self.denied_nodes.insert((user.clone(), id.clone()));
    }

    pub fn allow_node(&self, user: &UserId, id: &NodeId) {
        self.denied_nodes.remove(&(user.clone(), id.clone()));
    }
}

#[async_trait]
impl PermissionChecker for MemoryPermissions {
    async fn can_edit_project(&self, user: &UserId, project_id: &ProjectId) -> bool {
        !self.denied_projects.contains(&(user.clone(), project_id.clone()))
    }

    async fn can_mutate(&self, user: &UserId, id: &NodeId) -> bool {
        !self.denied_nodes.contains(&(user.clone(), id.clone()))
    }
}
