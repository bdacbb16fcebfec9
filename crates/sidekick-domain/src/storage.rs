//! Storage capability traits
//!
//! Backends (in-memory, SQLite) implement [`Storage`]; everything is
//! namespaced by workspace id. Lookup misses are [`StorageError::NotFound`]
//! so callers can treat them as "create"; validation failures name the empty
//! field and are never retried.

use async_trait::async_trait;

use crate::flow::Flow;
use crate::flow_action::FlowAction;
use crate::subflow::Subflow;
use crate::task::{Task, TaskStatus};
use crate::workspace::{Workspace, WorkspaceConfig};
use crate::worktree::Worktree;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("not found")]
    NotFound,

    /// A required field was empty or malformed. Named so tests and callers
    /// can see exactly which one.
    #[error("validation failed: {field} must not be empty")]
    Validation { field: String },

    #[error("storage error: {0}")]
    Io(String),
}

impl StorageError {
    pub fn validation(field: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Generic per-workspace KV, used for embedding and content caches.
#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn mget(&self, workspace_id: &str, keys: &[String])
        -> Result<Vec<Option<serde_json::Value>>>;
    async fn mset(
        &self,
        workspace_id: &str,
        values: &[(String, serde_json::Value)],
    ) -> Result<()>;
}

/// The full persistence contract of the Sidekick core.
///
/// Persist operations are full replaces keyed by id and idempotent under
/// retry. Validation of required fields happens before any write.
#[async_trait]
pub trait Storage: KvStorage {
    // Workspaces
    async fn persist_workspace(&self, workspace: Workspace) -> Result<()>;
    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace>;
    async fn get_all_workspaces(&self) -> Result<Vec<Workspace>>;

    // Workspace config
    async fn persist_workspace_config(
        &self,
        workspace_id: &str,
        config: WorkspaceConfig,
    ) -> Result<()>;
    async fn get_workspace_config(&self, workspace_id: &str) -> Result<WorkspaceConfig>;

    // Tasks
    async fn persist_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, workspace_id: &str, task_id: &str) -> Result<Task>;
    async fn get_tasks(&self, workspace_id: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>>;
    /// Archived tasks, newest first. Returns the page and the total count.
    async fn get_archived_tasks(
        &self,
        workspace_id: &str,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<Task>, u64)>;

    // Flows
    async fn persist_flow(&self, flow: Flow) -> Result<()>;
    async fn get_flow(&self, workspace_id: &str, flow_id: &str) -> Result<Flow>;
    async fn get_flows_for_task(&self, workspace_id: &str, task_id: &str) -> Result<Vec<Flow>>;

    // Subflows
    async fn persist_subflow(&self, subflow: Subflow) -> Result<()>;
    async fn get_subflows(&self, workspace_id: &str, flow_id: &str) -> Result<Vec<Subflow>>;
    async fn get_subflow(&self, workspace_id: &str, subflow_id: &str) -> Result<Subflow>;

    // Flow actions
    async fn persist_flow_action(&self, action: FlowAction) -> Result<()>;
    async fn get_flow_actions(&self, workspace_id: &str, flow_id: &str)
        -> Result<Vec<FlowAction>>;
    async fn get_flow_action(&self, workspace_id: &str, action_id: &str) -> Result<FlowAction>;

    // Worktrees
    async fn persist_worktree(&self, worktree: Worktree) -> Result<()>;
    async fn get_worktree(&self, workspace_id: &str, worktree_id: &str) -> Result<Worktree>;
    async fn get_worktrees(&self, workspace_id: &str) -> Result<Vec<Worktree>>;
    async fn delete_worktree(&self, workspace_id: &str, worktree_id: &str) -> Result<()>;

    /// Health check.
    async fn check_connection(&self) -> Result<()>;
}
