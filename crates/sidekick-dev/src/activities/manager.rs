//! Dev Agent Manager activities

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use sidekick_domain::{
    AgentType, Flow, FlowStatus, RequestForUser, Storage, Streamer, Task, TaskStatus, Workspace,
};
use sidekick_durable::{Activity, ActivityContext, ActivityError};

use super::storage_err;

/// KV key for the pending-user-request row of a flow.
pub fn pending_user_request_key(origin_workflow_id: &str) -> String {
    format!("pending_user_request:{origin_workflow_id}")
}

/// Resolve a workspace, with `local_repo_dir` made absolute.
pub struct FindWorkspaceActivity {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FindWorkspaceInput {
    pub workspace_id: String,
}

#[async_trait]
impl Activity for FindWorkspaceActivity {
    const TYPE: &'static str = "find_workspace";
    type Input = FindWorkspaceInput;
    type Output = Workspace;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut workspace = self
            .storage
            .get_workspace(&input.workspace_id)
            .await
            .map_err(storage_err)?;
        if let Ok(absolute) = std::fs::canonicalize(&workspace.local_repo_dir) {
            workspace.local_repo_dir = absolute.to_string_lossy().into_owned();
        }
        Ok(workspace)
    }
}

pub struct PersistFlowActivity {
    pub storage: Arc<dyn Storage>,
}

#[async_trait]
impl Activity for PersistFlowActivity {
    const TYPE: &'static str = "persist_flow";
    type Input = Flow;
    type Output = Flow;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.storage
            .persist_flow(input.clone())
            .await
            .map_err(storage_err)?;
        Ok(input)
    }
}

pub struct GetFlowActivity {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetFlowInput {
    pub workspace_id: String,
    pub flow_id: String,
}

#[async_trait]
impl Activity for GetFlowActivity {
    const TYPE: &'static str = "get_flow";
    type Input = GetFlowInput;
    type Output = Flow;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.storage
            .get_flow(&input.workspace_id, &input.flow_id)
            .await
            .map_err(storage_err)
    }
}

/// Flows previously dispatched for a task; used to hold the one-in-progress
/// invariant before dispatching another.
pub struct GetFlowsForTaskActivity {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetFlowsForTaskInput {
    pub workspace_id: String,
    pub task_id: String,
}

#[async_trait]
impl Activity for GetFlowsForTaskActivity {
    const TYPE: &'static str = "get_flows_for_task";
    type Input = GetFlowsForTaskInput;
    type Output = Vec<Flow>;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.storage
            .get_flows_for_task(&input.workspace_id, &input.task_id)
            .await
            .map_err(storage_err)
    }
}

/// Persist a "pending user request" row so it survives manager restarts.
pub struct CreatePendingUserRequestActivity {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePendingUserRequestInput {
    pub workspace_id: String,
    pub request: RequestForUser,
}

#[async_trait]
impl Activity for CreatePendingUserRequestActivity {
    const TYPE: &'static str = "create_pending_user_request";
    type Input = CreatePendingUserRequestInput;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let key = pending_user_request_key(&input.request.origin_workflow_id);
        let value = serde_json::to_value(&input.request)
            .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
        self.storage
            .mset(&input.workspace_id, &[(key, value)])
            .await
            .map_err(storage_err)
    }
}

/// Mark a flow's parent task blocked on user input.
pub struct UpdateTaskForUserRequestActivity {
    pub storage: Arc<dyn Storage>,
    pub streamer: Arc<dyn Streamer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateTaskForUserRequestInput {
    pub workspace_id: String,
    pub flow_id: String,
}

#[async_trait]
impl Activity for UpdateTaskForUserRequestActivity {
    const TYPE: &'static str = "update_task_for_user_request";
    type Input = UpdateTaskForUserRequestInput;
    type Output = Task;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let flow = self
            .storage
            .get_flow(&input.workspace_id, &input.flow_id)
            .await
            .map_err(storage_err)?;
        let mut task = self
            .storage
            .get_task(&input.workspace_id, &flow.parent_id)
            .await
            .map_err(storage_err)?;

        task.status = TaskStatus::Blocked;
        task.agent_type = AgentType::Human;
        task.updated = Utc::now();
        self.storage
            .persist_task(task.clone())
            .await
            .map_err(storage_err)?;
        self.streamer
            .add_task_change(task.clone())
            .await
            .map_err(storage_err)?;
        Ok(task)
    }
}

/// Close a flow's parent task with the flow's terminal status.
pub struct CompleteFlowParentTaskActivity {
    pub storage: Arc<dyn Storage>,
    pub streamer: Arc<dyn Streamer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteFlowParentTaskInput {
    pub workspace_id: String,
    pub parent_task_id: String,
    pub flow_status: FlowStatus,
}

#[async_trait]
impl Activity for CompleteFlowParentTaskActivity {
    const TYPE: &'static str = "complete_flow_parent_task";
    type Input = CompleteFlowParentTaskInput;
    type Output = Task;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut task = self
            .storage
            .get_task(&input.workspace_id, &input.parent_task_id)
            .await
            .map_err(storage_err)?;

        task.status = match input.flow_status {
            FlowStatus::Completed => TaskStatus::Complete,
            // Tasks have no cancelled status; a cancelled flow leaves its
            // task failed so it is visibly terminal.
            FlowStatus::Failed | FlowStatus::Cancelled => TaskStatus::Failed,
            FlowStatus::InProgress => TaskStatus::InProgress,
        };
        task.agent_type = AgentType::None;
        task.updated = Utc::now();

        self.storage
            .persist_task(task.clone())
            .await
            .map_err(storage_err)?;
        self.streamer
            .add_task_change(task.clone())
            .await
            .map_err(storage_err)?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidekick_domain::FlowType;
    use sidekick_storage::{MemoryStorage, MemoryStreamer};

    fn ctx() -> ActivityContext {
        ActivityContext::new("flow_1", "a-1", 1, 3)
    }

    async fn seed_task_and_flow(storage: &MemoryStorage) -> (Task, Flow) {
        let now = Utc::now();
        let task = Task {
            id: "task_1".to_string(),
            workspace_id: "ws_1".to_string(),
            status: TaskStatus::InProgress,
            flow_type: FlowType::BasicDev,
            agent_type: AgentType::Llm,
            created: now,
            updated: now,
            ..Default::default()
        };
        storage.persist_task(task.clone()).await.unwrap();

        let flow = Flow {
            id: "flow_1".to_string(),
            workspace_id: "ws_1".to_string(),
            flow_type: FlowType::BasicDev,
            parent_id: "task_1".to_string(),
            status: FlowStatus::InProgress,
        };
        storage.persist_flow(flow.clone()).await.unwrap();
        (task, flow)
    }

    #[tokio::test]
    async fn test_update_task_for_user_request_blocks_task() {
        let storage = Arc::new(MemoryStorage::new());
        let streamer = Arc::new(MemoryStreamer::new());
        seed_task_and_flow(&storage).await;

        let activity = UpdateTaskForUserRequestActivity {
            storage: storage.clone(),
            streamer: streamer.clone(),
        };
        let task = activity
            .execute(
                &ctx(),
                UpdateTaskForUserRequestInput {
                    workspace_id: "ws_1".to_string(),
                    flow_id: "flow_1".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.agent_type, AgentType::Human);

        let stored = storage.get_task("ws_1", "task_1").await.unwrap();
        assert_eq!(stored.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_complete_flow_parent_task_maps_statuses() {
        let storage = Arc::new(MemoryStorage::new());
        let streamer = Arc::new(MemoryStreamer::new());
        seed_task_and_flow(&storage).await;

        let activity = CompleteFlowParentTaskActivity {
            storage: storage.clone(),
            streamer,
        };

        for (flow_status, expected) in [
            (FlowStatus::Completed, TaskStatus::Complete),
            (FlowStatus::Failed, TaskStatus::Failed),
            (FlowStatus::Cancelled, TaskStatus::Failed),
        ] {
            let task = activity
                .execute(
                    &ctx(),
                    CompleteFlowParentTaskInput {
                        workspace_id: "ws_1".to_string(),
                        parent_task_id: "task_1".to_string(),
                        flow_status,
                    },
                )
                .await
                .unwrap();
            assert_eq!(task.status, expected);
            assert_eq!(task.agent_type, AgentType::None);
        }
    }

    #[tokio::test]
    async fn test_get_flow_not_found_is_non_retryable() {
        let storage = Arc::new(MemoryStorage::new());
        let activity = GetFlowActivity { storage };
        let err = activity
            .execute(
                &ctx(),
                GetFlowInput {
                    workspace_id: "ws_1".to_string(),
                    flow_id: "flow_missing".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("NOT_FOUND"));
    }
}
