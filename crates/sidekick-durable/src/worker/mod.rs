//! Activity worker
//!
//! Claims activity tasks from one task queue and executes them as
//! preemptible tokio tasks bounded by a semaphore, with per-attempt
//! timeouts. Outcomes feed back into the executor, which drives the owning
//! workflow forward. Cancellation of a workflow propagates to its in-flight
//! activities through their cancellation handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::{
    ActivityContext, ActivityError, ActivityOutcome, ActivityRegistry, CancellationHandle,
};
use crate::engine::WorkflowExecutor;
use crate::persistence::{ClaimedTask, TaskFailureOutcome, WorkflowEventStore};

/// Observes activity execution around the worker. The dev layer uses this to
/// persist and stream flow-action transitions for tracked activities.
#[async_trait]
pub trait ActivityInterceptor: Send + Sync {
    async fn on_activity_start(&self, task: &ClaimedTask);
    async fn on_activity_finish(&self, task: &ClaimedTask, outcome: &ActivityOutcome);
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Queue this worker claims tasks from.
    pub task_queue: String,
    /// Maximum concurrent activity executions.
    pub max_concurrency: usize,
    /// How long to park when the queue is empty.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: task_queue.into(),
            max_concurrency: 4,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

pub struct Worker<S: WorkflowEventStore> {
    config: WorkerConfig,
    store: Arc<S>,
    executor: Arc<WorkflowExecutor<S>>,
    activities: Arc<ActivityRegistry>,
    interceptor: Option<Arc<dyn ActivityInterceptor>>,
}

/// Handle to a running worker; dropping it does not stop the worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop claiming new tasks and wait for the poll loop to exit. In-flight
    /// activities finish on their own tokio tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

impl<S: WorkflowEventStore> Worker<S> {
    pub fn new(
        executor: Arc<WorkflowExecutor<S>>,
        activities: Arc<ActivityRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store: executor.store().clone(),
            executor,
            activities,
            interceptor: None,
            config,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ActivityInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Start the poll loop and the cancellation listener.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running: Arc<Mutex<HashMap<Uuid, (String, CancellationHandle)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Propagate workflow terminations to in-flight activities.
        let mut terminations = self.executor.subscribe_terminations();
        let cancel_running = running.clone();
        let mut cancel_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_shutdown.changed() => break,
                    closed = terminations.recv() => match closed {
                        Ok(workflow_id) => {
                            let running = cancel_running.lock();
                            for (task_workflow_id, handle) in running.values() {
                                if *task_workflow_id == workflow_id {
                                    handle.cancel();
                                }
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        let join = tokio::spawn(self.poll_loop(shutdown_rx, running));
        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn poll_loop(
        self,
        shutdown: watch::Receiver<bool>,
        running: Arc<Mutex<HashMap<Uuid, (String, CancellationHandle)>>>,
    ) {
        let worker = Arc::new(self);
        let semaphore = Arc::new(Semaphore::new(worker.config.max_concurrency));
        info!(
            worker_id = %worker.config.worker_id,
            task_queue = %worker.config.task_queue,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let free = semaphore.available_permits();
            if free == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }

            let claimed = match worker
                .store
                .claim_tasks(&worker.config.worker_id, &worker.config.task_queue, free)
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "failed to claim tasks");
                    tokio::time::sleep(worker.config.poll_interval).await;
                    continue;
                }
            };

            if claimed.is_empty() {
                worker
                    .store
                    .wait_for_tasks(&worker.config.task_queue, worker.config.poll_interval)
                    .await;
                continue;
            }

            for task in claimed {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore");
                let worker = worker.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.execute_task(task, running).await;
                });
            }
        }

        info!(worker_id = %worker.config.worker_id, "worker stopped");
    }

    async fn execute_task(
        self: &Arc<Self>,
        task: ClaimedTask,
        running: Arc<Mutex<HashMap<Uuid, (String, CancellationHandle)>>>,
    ) {
        debug!(
            workflow_id = %task.workflow_id,
            activity_id = %task.activity_id,
            activity_type = %task.activity_type,
            attempt = task.attempt,
            "executing activity"
        );

        let ctx = ActivityContext::new(
            task.workflow_id.clone(),
            task.activity_id.clone(),
            task.attempt,
            task.max_attempts,
        );
        running
            .lock()
            .insert(task.id, (task.workflow_id.clone(), ctx.cancellation_handle()));

        if let Some(interceptor) = &self.interceptor {
            interceptor.on_activity_start(&task).await;
        }
        if let Err(e) = self
            .executor
            .record_activity_started(
                &task.workflow_id,
                &task.activity_id,
                task.attempt,
                &self.config.worker_id,
            )
            .await
        {
            warn!(error = %e, "failed to record activity start");
        }

        let execution = self
            .activities
            .execute(&task.activity_type, ctx, task.input.clone());
        let result =
            match tokio::time::timeout(task.options.start_to_close_timeout, execution).await {
                Ok(result) => result,
                Err(_) => Err(ActivityError::retryable(format!(
                    "activity timed out after {:?}",
                    task.options.start_to_close_timeout
                ))
                .with_type("TIMEOUT")),
            };

        running.lock().remove(&task.id);

        match result {
            Ok(value) => {
                if let Err(e) = self.store.complete_task(task.id, value.clone()).await {
                    error!(error = %e, "failed to mark task completed");
                }
                if let Some(interceptor) = &self.interceptor {
                    interceptor
                        .on_activity_finish(&task, &ActivityOutcome::Completed(value.clone()))
                        .await;
                }
                if let Err(e) = self
                    .executor
                    .on_activity_completed(&task.workflow_id, &task.activity_id, value)
                    .await
                {
                    error!(error = %e, workflow_id = %task.workflow_id, "failed to deliver activity completion");
                }
            }
            Err(activity_error) => {
                let outcome = match self.store.fail_task(task.id, &activity_error).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(error = %e, "failed to mark task failed");
                        TaskFailureOutcome::ExhaustedRetries
                    }
                };
                let will_retry = matches!(outcome, TaskFailureOutcome::WillRetry { .. });

                debug!(
                    workflow_id = %task.workflow_id,
                    activity_id = %task.activity_id,
                    error = %activity_error,
                    will_retry,
                    "activity failed"
                );

                if let Some(interceptor) = &self.interceptor {
                    interceptor
                        .on_activity_finish(
                            &task,
                            &ActivityOutcome::Failed {
                                error: activity_error.clone(),
                                will_retry,
                            },
                        )
                        .await;
                }
                if let Err(e) = self
                    .executor
                    .on_activity_failed(
                        &task.workflow_id,
                        &task.activity_id,
                        activity_error,
                        will_retry,
                    )
                    .await
                {
                    error!(error = %e, workflow_id = %task.workflow_id, "failed to deliver activity failure");
                }
            }
        }
    }
}
