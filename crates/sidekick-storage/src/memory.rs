//! In-memory storage implementation
//!
//! Backs the test suite and dev mode. Provides the same key layout
//! semantics the persistent backends use: entities keyed by
//! `(workspaceId, entityId)`, with per-parent index lists for flow-scoped
//! lookups.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use sidekick_domain::storage::Result;
use sidekick_domain::{
    Flow, FlowAction, KvStorage, Storage, StorageError, Subflow, Task, TaskStatus, Workspace,
    WorkspaceConfig, Worktree,
};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryStorage {
    workspaces: RwLock<HashMap<String, Workspace>>,
    workspace_configs: RwLock<HashMap<String, WorkspaceConfig>>,
    tasks: RwLock<HashMap<Key, Task>>,
    flows: RwLock<HashMap<Key, Flow>>,
    subflows: RwLock<HashMap<Key, Subflow>>,
    /// Subflow ids per (workspace, flow), in insertion order.
    subflows_by_flow: RwLock<HashMap<Key, Vec<String>>>,
    flow_actions: RwLock<HashMap<Key, FlowAction>>,
    /// Flow-action ids per (workspace, flow), in insertion order.
    actions_by_flow: RwLock<HashMap<Key, Vec<String>>>,
    worktrees: RwLock<HashMap<Key, Worktree>>,
    kv: RwLock<HashMap<Key, serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StorageError::validation(field));
    }
    Ok(())
}

#[async_trait]
impl KvStorage for MemoryStorage {
    async fn mget(
        &self,
        workspace_id: &str,
        keys: &[String],
    ) -> Result<Vec<Option<serde_json::Value>>> {
        let kv = self.kv.read();
        Ok(keys
            .iter()
            .map(|key| kv.get(&(workspace_id.to_string(), key.clone())).cloned())
            .collect())
    }

    async fn mset(
        &self,
        workspace_id: &str,
        values: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let mut kv = self.kv.write();
        for (key, value) in values {
            kv.insert((workspace_id.to_string(), key.clone()), value.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn persist_workspace(&self, workspace: Workspace) -> Result<()> {
        require("workspace.Id", &workspace.id)?;
        self.workspaces
            .write()
            .insert(workspace.id.clone(), workspace);
        Ok(())
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.workspaces
            .read()
            .get(workspace_id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_all_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut workspaces: Vec<_> = self.workspaces.read().values().cloned().collect();
        workspaces.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workspaces)
    }

    async fn persist_workspace_config(
        &self,
        workspace_id: &str,
        config: WorkspaceConfig,
    ) -> Result<()> {
        require("workspaceId", workspace_id)?;
        self.workspace_configs
            .write()
            .insert(workspace_id.to_string(), config);
        Ok(())
    }

    async fn get_workspace_config(&self, workspace_id: &str) -> Result<WorkspaceConfig> {
        self.workspace_configs
            .read()
            .get(workspace_id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn persist_task(&self, task: Task) -> Result<()> {
        require("workspaceId", &task.workspace_id)?;
        require("task.Id", &task.id)?;
        self.tasks
            .write()
            .insert((task.workspace_id.clone(), task.id.clone()), task);
        Ok(())
    }

    async fn get_task(&self, workspace_id: &str, task_id: &str) -> Result<Task> {
        self.tasks
            .read()
            .get(&(workspace_id.to_string(), task_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_tasks(&self, workspace_id: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.workspace_id == workspace_id)
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn get_archived_tasks(
        &self,
        workspace_id: &str,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<Task>, u64)> {
        let mut archived: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.workspace_id == workspace_id && t.status == TaskStatus::Archived)
            .cloned()
            .collect();
        archived.sort_by(|a, b| b.updated.cmp(&a.updated));

        let total = archived.len() as u64;
        let page = page.max(1);
        let start = ((page - 1) * page_size) as usize;
        let tasks = archived
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        Ok((tasks, total))
    }

    async fn persist_flow(&self, flow: Flow) -> Result<()> {
        require("workspaceId", &flow.workspace_id)?;
        require("flow.Id", &flow.id)?;
        self.flows
            .write()
            .insert((flow.workspace_id.clone(), flow.id.clone()), flow);
        Ok(())
    }

    async fn get_flow(&self, workspace_id: &str, flow_id: &str) -> Result<Flow> {
        self.flows
            .read()
            .get(&(workspace_id.to_string(), flow_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_flows_for_task(&self, workspace_id: &str, task_id: &str) -> Result<Vec<Flow>> {
        let mut flows: Vec<_> = self
            .flows
            .read()
            .values()
            .filter(|f| f.workspace_id == workspace_id && f.parent_id == task_id)
            .cloned()
            .collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(flows)
    }

    async fn persist_subflow(&self, subflow: Subflow) -> Result<()> {
        require("workspaceId", &subflow.workspace_id)?;
        require("subflow.Id", &subflow.id)?;
        require("subflow.FlowId", &subflow.flow_id)?;

        let key = (subflow.workspace_id.clone(), subflow.id.clone());
        let flow_key = (subflow.workspace_id.clone(), subflow.flow_id.clone());

        let mut subflows = self.subflows.write();
        if !subflows.contains_key(&key) {
            self.subflows_by_flow
                .write()
                .entry(flow_key)
                .or_default()
                .push(subflow.id.clone());
        }
        subflows.insert(key, subflow);
        Ok(())
    }

    async fn get_subflows(&self, workspace_id: &str, flow_id: &str) -> Result<Vec<Subflow>> {
        let ids = self
            .subflows_by_flow
            .read()
            .get(&(workspace_id.to_string(), flow_id.to_string()))
            .cloned()
            .unwrap_or_default();
        let subflows = self.subflows.read();
        Ok(ids
            .iter()
            .filter_map(|id| subflows.get(&(workspace_id.to_string(), id.clone())).cloned())
            .collect())
    }

    async fn get_subflow(&self, workspace_id: &str, subflow_id: &str) -> Result<Subflow> {
        self.subflows
            .read()
            .get(&(workspace_id.to_string(), subflow_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn persist_flow_action(&self, action: FlowAction) -> Result<()> {
        require("workspaceId", &action.workspace_id)?;
        require("flowAction.Id", &action.id)?;
        require("flowAction.FlowId", &action.flow_id)?;

        let key = (action.workspace_id.clone(), action.id.clone());
        let flow_key = (action.workspace_id.clone(), action.flow_id.clone());

        let mut actions = self.flow_actions.write();
        if !actions.contains_key(&key) {
            self.actions_by_flow
                .write()
                .entry(flow_key)
                .or_default()
                .push(action.id.clone());
        }
        actions.insert(key, action);
        Ok(())
    }

    async fn get_flow_actions(
        &self,
        workspace_id: &str,
        flow_id: &str,
    ) -> Result<Vec<FlowAction>> {
        let ids = self
            .actions_by_flow
            .read()
            .get(&(workspace_id.to_string(), flow_id.to_string()))
            .cloned()
            .unwrap_or_default();
        let actions = self.flow_actions.read();
        Ok(ids
            .iter()
            .filter_map(|id| actions.get(&(workspace_id.to_string(), id.clone())).cloned())
            .collect())
    }

    async fn get_flow_action(&self, workspace_id: &str, action_id: &str) -> Result<FlowAction> {
        self.flow_actions
            .read()
            .get(&(workspace_id.to_string(), action_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn persist_worktree(&self, worktree: Worktree) -> Result<()> {
        require("workspaceId", &worktree.workspace_id)?;
        require("worktree.Id", &worktree.id)?;
        require("worktree.FlowId", &worktree.flow_id)?;
        self.worktrees
            .write()
            .insert((worktree.workspace_id.clone(), worktree.id.clone()), worktree);
        Ok(())
    }

    async fn get_worktree(&self, workspace_id: &str, worktree_id: &str) -> Result<Worktree> {
        self.worktrees
            .read()
            .get(&(workspace_id.to_string(), worktree_id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_worktrees(&self, workspace_id: &str) -> Result<Vec<Worktree>> {
        let mut worktrees: Vec<_> = self
            .worktrees
            .read()
            .values()
            .filter(|w| w.workspace_id == workspace_id)
            .cloned()
            .collect();
        worktrees.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(worktrees)
    }

    async fn delete_worktree(&self, workspace_id: &str, worktree_id: &str) -> Result<()> {
        self.worktrees
            .write()
            .remove(&(workspace_id.to_string(), worktree_id.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subflow_validation_names_empty_field() {
        let storage = MemoryStorage::new();

        let valid = Subflow {
            workspace_id: "ws_1".to_string(),
            id: "sf_1".to_string(),
            flow_id: "flow_1".to_string(),
            name: "Test Subflow".to_string(),
            ..Default::default()
        };

        for (field, subflow) in [
            (
                "workspaceId",
                Subflow {
                    workspace_id: String::new(),
                    ..valid.clone()
                },
            ),
            (
                "subflow.Id",
                Subflow {
                    id: String::new(),
                    ..valid.clone()
                },
            ),
            (
                "subflow.FlowId",
                Subflow {
                    flow_id: String::new(),
                    ..valid.clone()
                },
            ),
        ] {
            let err = storage.persist_subflow(subflow).await.unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected error naming {field}, got: {err}"
            );
        }

        storage.persist_subflow(valid).await.unwrap();
    }

    #[tokio::test]
    async fn test_kv_round_trip() {
        let storage = MemoryStorage::new();
        storage
            .mset(
                "ws_1",
                &[("embedding:abc".to_string(), serde_json::json!([0.1, 0.2]))],
            )
            .await
            .unwrap();

        let values = storage
            .mget(
                "ws_1",
                &["embedding:abc".to_string(), "missing".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(values[0], Some(serde_json::json!([0.1, 0.2])));
        assert_eq!(values[1], None);

        // Keyspaces are per-workspace.
        let other = storage
            .mget("ws_2", &["embedding:abc".to_string()])
            .await
            .unwrap();
        assert_eq!(other[0], None);
    }
}
