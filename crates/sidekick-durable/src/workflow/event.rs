//! Persisted workflow events
//!
//! Events form the append-only log for a workflow. They are immutable once
//! written; workflow state is reconstructed by replaying them in sequence
//! order.

use serde::{Deserialize, Serialize};

use super::{ActivityOptions, ParentClosePolicy, WorkflowError, WorkflowSignal, WorkflowUpdate};
use crate::activity::ActivityError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // Workflow lifecycle
    WorkflowStarted {
        input: serde_json::Value,
    },
    WorkflowCompleted {
        result: serde_json::Value,
    },
    WorkflowFailed {
        error: WorkflowError,
    },
    WorkflowCancelled {
        reason: String,
    },
    /// Marks the point where the history was truncated and restarted with a
    /// fresh input. Always the last event of the old history.
    WorkflowContinuedAsNew {
        input: serde_json::Value,
    },
    /// An external cancellation request was delivered.
    CancelRequested {
        reason: String,
    },

    // Activity lifecycle
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },
    ActivityStarted {
        activity_id: String,
        /// 1-based attempt number
        attempt: u32,
        worker_id: String,
    },
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        /// Whether another attempt will be made. Only final failures are
        /// dispatched to the workflow.
        will_retry: bool,
    },
    ActivityCancelled {
        activity_id: String,
        reason: String,
    },

    // Timers
    TimerStarted {
        timer_id: String,
        duration_ms: u64,
    },
    TimerFired {
        timer_id: String,
    },

    // External communication
    SignalReceived {
        signal: WorkflowSignal,
    },
    UpdateReceived {
        update: WorkflowUpdate,
    },
    UpdateCompleted {
        update_id: String,
        result: serde_json::Value,
    },
    UpdateFailed {
        update_id: String,
        error: WorkflowError,
    },

    // Determinism markers
    /// Value of a recorded side effect, in invocation order.
    SideEffectRecorded {
        value: serde_json::Value,
    },
    /// Branch chosen for a versioned behavior change.
    VersionMarked {
        change_id: String,
        version: i32,
    },

    // Child workflows
    ChildWorkflowInitiated {
        workflow_id: String,
        workflow_type: String,
        #[serde(default)]
        parent_close_policy: ParentClosePolicy,
    },
    /// The child's execution has started (not completed).
    ChildWorkflowStarted {
        workflow_id: String,
    },
    ChildWorkflowClosed {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkflowError>,
    },
}

impl WorkflowEvent {
    /// The activity id if this is an activity-related event.
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityCancelled { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Whether this is a terminal workflow event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }
}
