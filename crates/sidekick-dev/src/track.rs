//! Flow-action tracking
//!
//! Every tracked workflow step produces exactly one [`FlowAction`] with the
//! lifecycle pending → started → completed | failed, and every transition is
//! appended to the flow's change stream. Workflows attach a
//! [`TrackMetadata`] to an activity's options; the [`FlowActionTracker`]
//! interceptor persists and streams the transitions around the activity's
//! execution on the worker.
//!
//! Flow-action ids are derived from the flow and activity ids, so a retried
//! activity updates the same action instead of creating a new one. Because
//! the flow workflow is the only writer to its own change stream, the
//! stream stays totally ordered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use sidekick_domain::{FlowAction, FlowActionStatus, Storage, Streamer};
use sidekick_durable::{ActivityInterceptor, ActivityOutcome, ClaimedTask};

/// Tracking metadata carried on `ActivityOptions::metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    pub workspace_id: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subflow_id: String,
    pub action_type: String,
    #[serde(default)]
    pub action_params: serde_json::Value,
}

impl TrackMetadata {
    pub fn from_options_metadata(metadata: Option<&serde_json::Value>) -> Option<Self> {
        metadata.and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Deterministic flow-action id for a tracked activity.
pub fn flow_action_id(flow_id: &str, activity_id: &str) -> String {
    format!("fa_{flow_id}_{activity_id}")
}

/// Persists and streams flow-action transitions for tracked activities.
pub struct FlowActionTracker {
    storage: Arc<dyn Storage>,
    streamer: Arc<dyn Streamer>,
}

impl FlowActionTracker {
    pub fn new(storage: Arc<dyn Storage>, streamer: Arc<dyn Streamer>) -> Self {
        Self { storage, streamer }
    }

    async fn record(&self, action: FlowAction) {
        if let Err(e) = self.storage.persist_flow_action(action.clone()).await {
            warn!(action_id = %action.id, error = %e, "failed to persist flow action");
            return;
        }
        if let Err(e) = self.streamer.add_flow_action_change(action.clone()).await {
            warn!(action_id = %action.id, error = %e, "failed to stream flow action change");
        }
    }
}

#[async_trait]
impl ActivityInterceptor for FlowActionTracker {
    async fn on_activity_start(&self, task: &ClaimedTask) {
        let Some(meta) = TrackMetadata::from_options_metadata(task.options.metadata.as_ref())
        else {
            return;
        };
        // Retries keep updating the action created by the first attempt.
        if task.attempt > 1 {
            return;
        }

        let now = Utc::now();
        let mut action = FlowAction {
            id: flow_action_id(&meta.flow_id, &task.activity_id),
            workspace_id: meta.workspace_id.clone(),
            flow_id: meta.flow_id.clone(),
            subflow_id: meta.subflow_id.clone(),
            action_type: meta.action_type.clone(),
            action_params: meta.action_params.clone(),
            status: FlowActionStatus::Pending,
            created: now,
            updated: now,
            ..Default::default()
        };
        self.record(action.clone()).await;

        action.status = FlowActionStatus::Started;
        action.updated = Utc::now();
        self.record(action).await;
    }

    async fn on_activity_finish(&self, task: &ClaimedTask, outcome: &ActivityOutcome) {
        let Some(meta) = TrackMetadata::from_options_metadata(task.options.metadata.as_ref())
        else {
            return;
        };

        let (status, result, error_message) = match outcome {
            ActivityOutcome::Completed(value) => (
                FlowActionStatus::Completed,
                value.to_string(),
                String::new(),
            ),
            ActivityOutcome::Failed { will_retry: true, .. } => {
                // Not a terminal state; the next attempt continues the same
                // action.
                return;
            }
            ActivityOutcome::Failed { error, .. } => {
                (FlowActionStatus::Failed, String::new(), error.message.clone())
            }
        };

        let action_id = flow_action_id(&meta.flow_id, &task.activity_id);
        let mut action = match self
            .storage
            .get_flow_action(&meta.workspace_id, &action_id)
            .await
        {
            Ok(action) => action,
            Err(e) => {
                warn!(action_id = %action_id, error = %e, "tracked flow action missing at finish");
                return;
            }
        };

        action.status = status;
        action.result = result;
        action.error_message = error_message;
        action.updated = Utc::now();
        self.record(action).await;
    }
}
