//! Workflow actions and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{WorkflowError, WorkflowSignal};
use crate::retry::RetryPolicy;

/// What happens to a still-running child workflow when its parent closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentClosePolicy {
    /// Leave the child running. Used for flows dispatched by the manager,
    /// which outlive any single manager history.
    #[default]
    Abandon,

    /// Request cancellation of the child.
    RequestCancel,
}

/// Commands a workflow can issue in response to events.
///
/// Each action is persisted as a [`WorkflowEvent`](super::WorkflowEvent)
/// before it takes effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity on the workflow's task queue.
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,
        /// Registry key of the activity implementation
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Start a timer that fires after the given duration.
    StartTimer {
        timer_id: String,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Complete the workflow successfully.
    CompleteWorkflow { result: serde_json::Value },

    /// Fail the workflow.
    FailWorkflow { error: WorkflowError },

    /// Close the workflow as cancelled.
    CancelWorkflow { reason: String },

    /// Start a child workflow with a caller-chosen execution id.
    StartChildWorkflow {
        workflow_id: String,
        workflow_type: String,
        input: serde_json::Value,
        #[serde(default)]
        parent_close_policy: ParentClosePolicy,
        /// Task queue for the child's activities; inherits the parent's
        /// queue when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_queue: Option<String>,
    },

    /// Deliver a signal to another workflow execution.
    SignalExternalWorkflow {
        workflow_id: String,
        signal: WorkflowSignal,
    },

    /// Ask another workflow execution to cancel. Best effort: an unknown or
    /// already-closed target is logged, not an error.
    RequestCancelExternalWorkflow { workflow_id: String },

    /// Resolve a pending update with a result.
    CompleteUpdate {
        update_id: String,
        result: serde_json::Value,
    },

    /// Resolve a pending update with an error.
    FailUpdate {
        update_id: String,
        error: WorkflowError,
    },

    /// Replace this workflow's history with a fresh one carrying `input`,
    /// to bound event log growth.
    ContinueAsNew { input: serde_json::Value },

    /// Request cancellation of a scheduled activity.
    CancelActivity { activity_id: String },

    /// No action.
    None,
}

impl WorkflowAction {
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::CancelWorkflow {
            reason: reason.into(),
        }
    }

    pub fn signal_external(workflow_id: impl Into<String>, signal: WorkflowSignal) -> Self {
        Self::SignalExternalWorkflow {
            workflow_id: workflow_id.into(),
            signal,
        }
    }

    pub fn complete_update(update_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::CompleteUpdate {
            update_id: update_id.into(),
            result,
        }
    }

    pub fn fail_update(update_id: impl Into<String>, error: WorkflowError) -> Self {
        Self::FailUpdate {
            update_id: update_id.into(),
            error,
        }
    }
}

/// Options for activity execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    pub retry_policy: RetryPolicy,

    /// Maximum time for one execution attempt.
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// Opaque metadata carried to activity interceptors. The dev layer uses
    /// this for flow-action tracking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(10),
            metadata: None,
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Serde support for Duration as milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
