//! In-memory implementation of WorkflowEventStore
//!
//! The reference store, also the test substrate. Provides the same
//! semantics a database-backed implementation must: optimistic append,
//! per-queue task claiming with retry backoff, signal queues.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{WorkflowError, WorkflowEvent, WorkflowSignal};

struct WorkflowState {
    workflow_type: String,
    status: WorkflowStatus,
    input: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<WorkflowError>,
    task_queue: String,
    parent: Option<ParentRef>,
    children: Vec<String>,
    events: Vec<WorkflowEvent>,
    signals: Vec<WorkflowSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    claimed_by: Option<String>,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// In-memory workflow event store.
pub struct InMemoryWorkflowEventStore {
    workflows: RwLock<HashMap<String, WorkflowState>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    task_notify: Notify,
}

impl InMemoryWorkflowEventStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            task_notify: Notify::new(),
        }
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
        options: StartWorkflowOptions,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(workflow_id) {
            return Err(StoreError::WorkflowAlreadyExists(workflow_id.to_string()));
        }

        if let Some(parent) = &options.parent {
            let parent_state = workflows
                .get_mut(&parent.workflow_id)
                .ok_or_else(|| StoreError::WorkflowNotFound(parent.workflow_id.clone()))?;
            parent_state.children.push(workflow_id.to_string());
        }

        workflows.insert(
            workflow_id.to_string(),
            WorkflowState {
                workflow_type: workflow_type.to_string(),
                status: WorkflowStatus::Running,
                input,
                result: None,
                error: None,
                task_queue: options.task_queue,
                parent: options.parent,
                children: vec![],
                events: vec![],
                signals: vec![],
            },
        );
        Ok(())
    }

    async fn get_workflow_info(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError> {
        let workflows = self.workflows.read();
        let state = workflows
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(WorkflowInfo {
            id: workflow_id.to_string(),
            workflow_type: state.workflow_type.clone(),
            status: state.status,
            input: state.input.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            task_queue: state.task_queue.clone(),
            parent: state.parent.clone(),
        })
    }

    async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn append_events(
        &self,
        workflow_id: &str,
        expected_sequence: i64,
        events: Vec<WorkflowEvent>,
    ) -> Result<i64, StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        let current = state.events.len() as i64;
        if current != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current,
            });
        }

        state.events.extend(events);
        Ok(state.events.len() as i64)
    }

    async fn load_events(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<(i64, WorkflowEvent)>, StoreError> {
        let workflows = self.workflows.read();
        let state = workflows
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(state
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i as i64, e.clone()))
            .collect())
    }

    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        state.status = status;
        state.result = result;
        state.error = error;
        Ok(())
    }

    async fn reset_workflow(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        state.events = vec![WorkflowEvent::WorkflowStarted {
            input: input.clone(),
        }];
        state.input = input;
        state.status = WorkflowStatus::Running;
        state.result = None;
        state.error = None;
        Ok(())
    }

    async fn list_children(&self, workflow_id: &str) -> Result<Vec<WorkflowInfo>, StoreError> {
        let workflows = self.workflows.read();
        let state = workflows
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(state
            .children
            .iter()
            .filter_map(|child_id| {
                workflows.get(child_id).map(|child| WorkflowInfo {
                    id: child_id.clone(),
                    workflow_type: child.workflow_type.clone(),
                    status: child.status,
                    input: child.input.clone(),
                    result: child.result.clone(),
                    error: child.error.clone(),
                    task_queue: child.task_queue.clone(),
                    parent: child.parent.clone(),
                })
            })
            .collect())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        self.tasks.write().insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                claimed_by: None,
                available_at: Utc::now(),
                last_error: None,
            },
        );
        self.task_notify.notify_waiters();
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let mut claimed = vec![];

        // Claim oldest-available first so task order within a workflow stays
        // close to scheduling order.
        let mut runnable: Vec<_> = tasks
            .iter()
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending
                    && t.definition.task_queue == task_queue
                    && t.available_at <= now
            })
            .map(|(id, t)| (*id, t.available_at))
            .collect();
        runnable.sort_by_key(|(_, available_at)| *available_at);

        for (task_id, _) in runnable.into_iter().take(max_tasks) {
            let task = tasks.get_mut(&task_id).expect("task id from iteration");
            task.status = TaskStatus::Claimed;
            task.claimed_by = Some(worker_id.to_string());
            task.attempt += 1;

            claimed.push(ClaimedTask {
                id: task_id,
                workflow_id: task.definition.workflow_id.clone(),
                activity_id: task.definition.activity_id.clone(),
                activity_type: task.definition.activity_type.clone(),
                input: task.definition.input.clone(),
                options: task.definition.options.clone(),
                attempt: task.attempt,
                max_attempts: task.definition.options.retry_policy.max_attempts,
            });
        }

        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Completed;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.last_error = Some(error.message.clone());

        let policy = &task.definition.options.retry_policy;
        let retryable = error.retryable && policy.should_retry(error.error_type.as_deref());

        if retryable && policy.has_attempts_remaining(task.attempt) {
            let delay = policy.delay_for_attempt(task.attempt + 1);
            task.status = TaskStatus::Pending;
            task.claimed_by = None;
            task.available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.task_notify.notify_waiters();
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt: task.attempt + 1,
                delay,
            })
        } else {
            task.status = TaskStatus::Failed;
            Ok(TaskFailureOutcome::ExhaustedRetries)
        }
    }

    async fn cancel_pending_tasks(&self, workflow_id: &str) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write();
        let mut cancelled = 0;
        for task in tasks.values_mut() {
            if task.definition.workflow_id == workflow_id && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn wait_for_tasks(&self, _task_queue: &str, timeout: Duration) {
        tokio::select! {
            _ = self.task_notify.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    async fn send_signal(
        &self,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        state.signals.push(signal);
        Ok(())
    }

    async fn get_pending_signals(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowSignal>, StoreError> {
        let workflows = self.workflows.read();
        let state = workflows
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(state.signals.clone())
    }

    async fn mark_signals_processed(
        &self,
        workflow_id: &str,
        count: usize,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        state.signals = state.signals.split_off(count.min(state.signals.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ActivityOptions;

    fn options() -> StartWorkflowOptions {
        StartWorkflowOptions {
            task_queue: "default".to_string(),
            parent: None,
        }
    }

    fn task(workflow_id: &str) -> TaskDefinition {
        TaskDefinition {
            workflow_id: workflow_id.to_string(),
            activity_id: "step-1".to_string(),
            activity_type: "run_tests".to_string(),
            input: serde_json::json!({}),
            options: ActivityOptions::default(),
            task_queue: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap();

        let status = store.get_workflow_status("flow_1").await.unwrap();
        assert_eq!(status, WorkflowStatus::Running);

        let err = store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkflowAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_append_sequence_and_conflict() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap();

        let seq = store
            .append_events(
                "flow_1",
                0,
                vec![WorkflowEvent::WorkflowStarted {
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let result = store
            .append_events(
                "flow_1",
                5,
                vec![WorkflowEvent::TimerFired {
                    timer_id: "t".to_string(),
                }],
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { expected: 5, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn test_task_retry_then_exhaust() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap();
        let task_id = store.enqueue_task(task("flow_1")).await.unwrap();

        // attempt 1
        let claimed = store.claim_tasks("w1", "default", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);

        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("boom"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TaskFailureOutcome::WillRetry { next_attempt: 2, .. }
        ));

        // simulate the backoff delay elapsing
        {
            let mut tasks = store.tasks.write();
            tasks.get_mut(&task_id).unwrap().available_at = Utc::now();
        }

        // attempt 2 and 3
        for expected_attempt in [2u32, 3] {
            let claimed = store.claim_tasks("w1", "default", 10).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {expected_attempt}");
            assert_eq!(claimed[0].attempt, expected_attempt);
            let outcome = store
                .fail_task(task_id, &ActivityError::retryable("boom"))
                .await
                .unwrap();
            if expected_attempt == 3 {
                assert!(matches!(outcome, TaskFailureOutcome::ExhaustedRetries));
            } else {
                let mut tasks = store.tasks.write();
                tasks.get_mut(&task_id).unwrap().available_at = Utc::now();
            }
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_exhausts_immediately() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap();
        let task_id = store.enqueue_task(task("flow_1")).await.unwrap();
        store.claim_tasks("w1", "default", 1).await.unwrap();

        let outcome = store
            .fail_task(task_id, &ActivityError::non_retryable("bad input"))
            .await
            .unwrap();
        assert!(matches!(outcome, TaskFailureOutcome::ExhaustedRetries));
    }

    #[tokio::test]
    async fn test_task_queue_isolation() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap();

        let mut dev_task = task("flow_1");
        dev_task.task_queue = "ws_1".to_string();
        store.enqueue_task(dev_task).await.unwrap();

        assert!(store
            .claim_tasks("w1", "default", 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.claim_tasks("w1", "ws_1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_workflow_truncates_history() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("mgr", "manager", serde_json::json!({"n": 1}), options())
            .await
            .unwrap();
        store
            .append_events(
                "mgr",
                0,
                vec![
                    WorkflowEvent::WorkflowStarted {
                        input: serde_json::json!({"n": 1}),
                    },
                    WorkflowEvent::TimerFired {
                        timer_id: "t".to_string(),
                    },
                ],
            )
            .await
            .unwrap();

        store
            .reset_workflow("mgr", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let events = store.load_events("mgr").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].1,
            WorkflowEvent::WorkflowStarted { input } if input["n"] == 2
        ));

        let info = store.get_workflow_info("mgr").await.unwrap();
        assert_eq!(info.input["n"], 2);
        assert_eq!(info.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_signal_queue() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("flow_1", "basic_dev", serde_json::json!({}), options())
            .await
            .unwrap();

        store
            .send_signal("flow_1", WorkflowSignal::cancel("user"))
            .await
            .unwrap();
        let signals = store.get_pending_signals("flow_1").await.unwrap();
        assert_eq!(signals.len(), 1);

        store.mark_signals_processed("flow_1", 1).await.unwrap();
        assert!(store
            .get_pending_signals("flow_1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_children_tracking() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .create_workflow("mgr", "manager", serde_json::json!({}), options())
            .await
            .unwrap();
        store
            .create_workflow(
                "flow_1",
                "basic_dev",
                serde_json::json!({}),
                StartWorkflowOptions {
                    task_queue: "ws_1".to_string(),
                    parent: Some(ParentRef {
                        workflow_id: "mgr".to_string(),
                        close_policy: crate::workflow::ParentClosePolicy::Abandon,
                    }),
                },
            )
            .await
            .unwrap();

        let children = store.list_children("mgr").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "flow_1");
    }
}
