//! Subflow and user-request record activities
//!
//! These persist the bookkeeping entities the workflows create around their
//! steps. Regular step tracking rides on the activity interceptor
//! ([`crate::FlowActionTracker`]); the activities here cover records whose
//! lifetime is not one activity execution: subflows, and the user_request
//! flow actions that stay pending while a flow waits on a human.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use sidekick_domain::{FlowAction, FlowActionStatus, Storage, Streamer, Subflow, UserResponse};
use sidekick_durable::{Activity, ActivityContext, ActivityError};

use super::storage_err;

/// Persist a subflow (created, completed or failed).
pub struct PersistSubflowActivity {
    pub storage: Arc<dyn Storage>,
}

#[async_trait]
impl Activity for PersistSubflowActivity {
    const TYPE: &'static str = "persist_subflow";
    type Input = Subflow;
    type Output = Subflow;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.storage
            .persist_subflow(input.clone())
            .await
            .map_err(storage_err)?;
        Ok(input)
    }
}

/// Create the pending `user_request` flow action when a flow parks on human
/// input.
pub struct RecordUserRequestActivity {
    pub storage: Arc<dyn Storage>,
    pub streamer: Arc<dyn Streamer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordUserRequestInput {
    pub action_id: String,
    pub workspace_id: String,
    pub flow_id: String,
    #[serde(default)]
    pub subflow_id: String,
    /// e.g. "user_request", "user_request.continue"
    pub action_type: String,
    #[serde(default)]
    pub action_params: serde_json::Value,
}

#[async_trait]
impl Activity for RecordUserRequestActivity {
    const TYPE: &'static str = "record_user_request";
    type Input = RecordUserRequestInput;
    type Output = FlowAction;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let now = Utc::now();
        let action = FlowAction {
            id: input.action_id,
            workspace_id: input.workspace_id,
            flow_id: input.flow_id,
            subflow_id: input.subflow_id,
            action_type: input.action_type,
            action_params: input.action_params,
            status: FlowActionStatus::Pending,
            created: now,
            updated: now,
            ..Default::default()
        };
        self.storage
            .persist_flow_action(action.clone())
            .await
            .map_err(storage_err)?;
        self.streamer
            .add_flow_action_change(action.clone())
            .await
            .map_err(storage_err)?;
        Ok(action)
    }
}

/// Close a `user_request` flow action with the user's response as result.
pub struct ResolveUserRequestActivity {
    pub storage: Arc<dyn Storage>,
    pub streamer: Arc<dyn Streamer>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveUserRequestInput {
    pub workspace_id: String,
    pub action_id: String,
    pub response: UserResponse,
}

#[async_trait]
impl Activity for ResolveUserRequestActivity {
    const TYPE: &'static str = "resolve_user_request";
    type Input = ResolveUserRequestInput;
    type Output = FlowAction;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut action = self
            .storage
            .get_flow_action(&input.workspace_id, &input.action_id)
            .await
            .map_err(storage_err)?;

        action.status = FlowActionStatus::Completed;
        action.result = serde_json::to_string(&input.response)
            .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
        action.updated = Utc::now();

        self.storage
            .persist_flow_action(action.clone())
            .await
            .map_err(storage_err)?;
        self.streamer
            .add_flow_action_change(action.clone())
            .await
            .map_err(storage_err)?;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidekick_storage::{MemoryStorage, MemoryStreamer};

    #[tokio::test]
    async fn test_user_request_record_and_resolve() {
        let storage = Arc::new(MemoryStorage::new());
        let streamer = Arc::new(MemoryStreamer::new());
        let ctx = ActivityContext::new("flow_1", "a-1", 1, 3);

        let record = RecordUserRequestActivity {
            storage: storage.clone(),
            streamer: streamer.clone(),
        };
        let action = record
            .execute(
                &ctx,
                RecordUserRequestInput {
                    action_id: "fa_flow_1_user-request-1".to_string(),
                    workspace_id: "ws_1".to_string(),
                    flow_id: "flow_1".to_string(),
                    subflow_id: String::new(),
                    action_type: "user_request".to_string(),
                    action_params: serde_json::json!({"requestKind": "free_form"}),
                },
            )
            .await
            .unwrap();
        assert_eq!(action.status, FlowActionStatus::Pending);

        let resolve = ResolveUserRequestActivity {
            storage: storage.clone(),
            streamer,
        };
        let resolved = resolve
            .execute(
                &ctx,
                ResolveUserRequestInput {
                    workspace_id: "ws_1".to_string(),
                    action_id: action.id.clone(),
                    response: UserResponse {
                        target_workflow_id: "flow_1".to_string(),
                        content: Some("try a different approach".to_string()),
                        approved: None,
                        params: serde_json::Value::Null,
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(resolved.status, FlowActionStatus::Completed);
        assert!(resolved.result.contains("try a different approach"));
    }
}
