//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::{WorkflowAction, WorkflowContext, WorkflowSignal, WorkflowUpdate};
use crate::activity::ActivityError;

/// Error type for workflow failures.
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,
    /// Error code for programmatic handling.
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// How a child workflow ended, as observed by its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildWorkflowOutcome {
    Completed(serde_json::Value),
    Failed(WorkflowError),
}

/// A deterministic state machine driven by events.
///
/// Given the same event sequence a workflow must produce the same action
/// sequence; that is what makes replay-based recovery possible. Anything
/// nondeterministic must go through an activity,
/// [`WorkflowContext::side_effect`], or [`WorkflowContext::version`].
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier, used to look the workflow up in the registry
    /// during replay.
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + Clone;
    type Output: Serialize + DeserializeOwned + Send;

    /// Create an instance from input. Called both when starting and when
    /// replaying.
    fn new(input: Self::Input) -> Self;

    /// Called when the workflow starts (or replays from the beginning).
    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully.
    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails after all retries are exhausted.
    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called for each received signal, in delivery order.
    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = (ctx, signal);
        vec![]
    }

    /// Called for each received update. The workflow must eventually issue a
    /// `CompleteUpdate` or `FailUpdate` action for the update id, or the
    /// caller waits forever.
    fn on_update(&mut self, ctx: &mut WorkflowContext, update: &WorkflowUpdate) -> Vec<WorkflowAction> {
        let _ = ctx;
        vec![WorkflowAction::fail_update(
            update.update_id.clone(),
            WorkflowError::new(format!("unsupported update: {}", update.name))
                .with_code("UNSUPPORTED_UPDATE"),
        )]
    }

    /// Called once a requested child workflow execution has started.
    fn on_child_workflow_started(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, child_workflow_id);
        vec![]
    }

    /// Called when a child workflow closes (completed or failed).
    fn on_child_workflow_closed(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
        outcome: &ChildWorkflowOutcome,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, child_workflow_id, outcome);
        vec![]
    }

    /// Called when an external cancellation request is delivered. The
    /// default closes the workflow as cancelled immediately; workflows that
    /// need cleanup override this.
    fn on_cancel_requested(
        &mut self,
        ctx: &mut WorkflowContext,
        reason: &str,
    ) -> Vec<WorkflowAction> {
        let _ = ctx;
        vec![WorkflowAction::cancel(reason)]
    }

    /// Whether the workflow has reached a terminal state.
    fn is_completed(&self) -> bool;

    /// The workflow result, if completed successfully.
    fn result(&self) -> Option<Self::Output>;

    /// The workflow error, if failed.
    fn error(&self) -> Option<WorkflowError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        let error = WorkflowError::new("something went wrong");
        assert_eq!(error.to_string(), "something went wrong");
    }

    #[test]
    fn test_workflow_error_with_code() {
        let error = WorkflowError::new("bad flow type").with_code("INVALID_FLOW_TYPE");
        assert_eq!(error.code, Some("INVALID_FLOW_TYPE".to_string()));
    }
}
