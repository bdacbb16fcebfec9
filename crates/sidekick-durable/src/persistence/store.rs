//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{
    ActivityOptions, ParentClosePolicy, WorkflowError, WorkflowEvent, WorkflowSignal,
};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already exists: {0}")]
    WorkflowAlreadyExists(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Optimistic locking failed: someone else appended first.
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("store error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Options for creating a workflow execution.
#[derive(Debug, Clone, Default)]
pub struct StartWorkflowOptions {
    /// Task queue the workflow's activities are dispatched on.
    pub task_queue: String,

    /// Parent execution, for child workflows.
    pub parent: Option<ParentRef>,
}

#[derive(Debug, Clone)]
pub struct ParentRef {
    pub workflow_id: String,
    pub close_policy: ParentClosePolicy,
}

/// Stored workflow execution metadata.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub task_queue: String,
    pub parent: Option<ParentRef>,
}

/// An activity task to be enqueued.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub task_queue: String,
}

/// A task claimed by a worker for execution.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    /// 1-based attempt number for this execution.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Outcome of failing a task.
#[derive(Debug, Clone)]
pub enum TaskFailureOutcome {
    /// The task was requeued and will run again after `delay`.
    WillRetry { next_attempt: u32, delay: Duration },

    /// No attempts left (or the error was non-retryable); the workflow must
    /// be notified of the final failure.
    ExhaustedRetries,
}

/// Store for workflow event histories, the activity task queue, and signal
/// queues. Implementations must be thread-safe; persist operations are
/// atomic per row and idempotent under retry.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // Workflow operations

    async fn create_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
        options: StartWorkflowOptions,
    ) -> Result<(), StoreError>;

    async fn get_workflow_info(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError>;

    async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, StoreError>;

    /// Append events with optimistic concurrency; returns the new sequence.
    async fn append_events(
        &self,
        workflow_id: &str,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError>;

    /// Load the full history for replay.
    async fn load_events(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<(i64, WorkflowEvent)>, StoreError>;

    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    /// Continue-as-new: truncate the history to a single `WorkflowStarted`
    /// carrying `input`, keeping the execution id and metadata.
    async fn reset_workflow(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Child executions registered under this parent.
    async fn list_children(&self, workflow_id: &str) -> Result<Vec<WorkflowInfo>, StoreError>;

    // Task queue operations

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim up to `max_tasks` runnable tasks from a queue.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Fail a task; requeues with backoff while attempts remain and the
    /// error is retryable.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &crate::activity::ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Drop pending tasks of a workflow (it reached a terminal state).
    async fn cancel_pending_tasks(&self, workflow_id: &str) -> Result<usize, StoreError>;

    /// Wait until a task may be available on the queue, up to `timeout`.
    /// Lets workers poll without busy-waiting.
    async fn wait_for_tasks(&self, task_queue: &str, timeout: Duration);

    // Signal operations

    async fn send_signal(
        &self,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError>;

    async fn get_pending_signals(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowSignal>, StoreError>;

    async fn mark_signals_processed(
        &self,
        workflow_id: &str,
        count: usize,
    ) -> Result<(), StoreError>;
}
